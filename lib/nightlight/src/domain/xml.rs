// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Minimal indenting XML emitter for domain definitions.

use std::borrow::Cow;
use std::fmt::Write;

const INDENT: &str = "  ";

fn escape(raw: &str) -> Cow<'_, str> {
    if !raw.contains(['&', '<', '>', '\'', '"']) {
        return Cow::Borrowed(raw);
    }
    let mut out = String::with_capacity(raw.len() + 8);
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

#[derive(Default)]
pub(crate) struct XmlWriter {
    buf: String,
    open: Vec<&'static str>,
}

impl XmlWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn start_tag(&mut self, tag: &str, attrs: &[(&str, &str)]) {
        for _ in 0..self.open.len() {
            self.buf.push_str(INDENT);
        }
        self.buf.push('<');
        self.buf.push_str(tag);
        for (name, value) in attrs {
            // Writing to a String cannot fail.
            let _ = write!(self.buf, " {name}='{}'", escape(value));
        }
    }

    /// Opens `tag`; children are written until the matching [`close`].
    ///
    /// [`close`]: Self::close
    pub fn open(&mut self, tag: &'static str, attrs: &[(&str, &str)]) {
        self.start_tag(tag, attrs);
        self.buf.push_str(">\n");
        self.open.push(tag);
    }

    pub fn empty(&mut self, tag: &str, attrs: &[(&str, &str)]) {
        self.start_tag(tag, attrs);
        self.buf.push_str("/>\n");
    }

    pub fn text(&mut self, tag: &str, attrs: &[(&str, &str)], text: &str) {
        self.start_tag(tag, attrs);
        let _ = writeln!(self.buf, ">{}</{tag}>", escape(text));
    }

    pub fn close(&mut self) {
        if let Some(tag) = self.open.pop() {
            for _ in 0..self.open.len() {
                self.buf.push_str(INDENT);
            }
            let _ = writeln!(self.buf, "</{tag}>");
        }
    }

    /// Closes any elements still open and returns the document.
    pub fn finish(mut self) -> String {
        while !self.open.is_empty() {
            self.close();
        }
        self.buf
    }
}
