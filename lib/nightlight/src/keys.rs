// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Translation of console text into USB HID keyboard usage codes.

pub const KEY_ENTER: u32 = 0x28;
pub const KEY_ESCAPE: u32 = 0x29;
pub const KEY_BACKSPACE: u32 = 0x2a;
pub const KEY_TAB: u32 = 0x2b;
pub const KEY_SPACE: u32 = 0x2c;
pub const KEY_LEFT_SHIFT: u32 = 0xe1;

/// One key press: a usage code, optionally with left shift held.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyStroke {
    pub code: u32,
    pub shift: bool,
}

impl KeyStroke {
    const fn plain(code: u32) -> Self {
        Self { code, shift: false }
    }

    const fn shifted(code: u32) -> Self {
        Self { code, shift: true }
    }

    /// The codes to send together for this key.
    pub fn chord(&self) -> Vec<u32> {
        if self.shift {
            vec![KEY_LEFT_SHIFT, self.code]
        } else {
            vec![self.code]
        }
    }
}

/// Result of translating a string: the keys to send, and the characters
/// that have no key and were dropped.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Translation {
    pub strokes: Vec<KeyStroke>,
    pub unknown: Vec<char>,
}

fn punctuation(c: char) -> Option<KeyStroke> {
    let stroke = match c {
        '-' => KeyStroke::plain(0x2d),
        '_' => KeyStroke::shifted(0x2d),
        '=' => KeyStroke::plain(0x2e),
        '+' => KeyStroke::shifted(0x2e),
        '[' => KeyStroke::plain(0x2f),
        '{' => KeyStroke::shifted(0x2f),
        ']' => KeyStroke::plain(0x30),
        '}' => KeyStroke::shifted(0x30),
        '\\' => KeyStroke::plain(0x31),
        '|' => KeyStroke::shifted(0x31),
        ';' => KeyStroke::plain(0x33),
        ':' => KeyStroke::shifted(0x33),
        '\'' => KeyStroke::plain(0x34),
        '"' => KeyStroke::shifted(0x34),
        '`' => KeyStroke::plain(0x35),
        '~' => KeyStroke::shifted(0x35),
        ',' => KeyStroke::plain(0x36),
        '<' => KeyStroke::shifted(0x36),
        '.' => KeyStroke::plain(0x37),
        '>' => KeyStroke::shifted(0x37),
        '/' => KeyStroke::plain(0x38),
        '?' => KeyStroke::shifted(0x38),
        _ => return None,
    };
    Some(stroke)
}

// Shifted digit row, in key order 1..9, 0.
const DIGIT_SHIFTED: [char; 10] =
    ['!', '@', '#', '$', '%', '^', '&', '*', '(', ')'];

/// The key for one character, if it has one on a US layout.
pub fn key_for(c: char) -> Option<KeyStroke> {
    match c {
        'a'..='z' => Some(KeyStroke::plain(0x04 + (c as u32 - 'a' as u32))),
        'A'..='Z' => Some(KeyStroke::shifted(0x04 + (c as u32 - 'A' as u32))),
        '1'..='9' => Some(KeyStroke::plain(0x1e + (c as u32 - '1' as u32))),
        '0' => Some(KeyStroke::plain(0x27)),
        ' ' => Some(KeyStroke::plain(KEY_SPACE)),
        '\n' | '\r' => Some(KeyStroke::plain(KEY_ENTER)),
        '\t' => Some(KeyStroke::plain(KEY_TAB)),
        '\x08' => Some(KeyStroke::plain(KEY_BACKSPACE)),
        '\x1b' => Some(KeyStroke::plain(KEY_ESCAPE)),
        _ => DIGIT_SHIFTED
            .iter()
            .position(|d| *d == c)
            .map(|i| KeyStroke::shifted(0x1e + i as u32))
            .or_else(|| punctuation(c)),
    }
}

pub fn translate(text: &str) -> Translation {
    let mut out = Translation::default();
    for c in text.chars() {
        match key_for(c) {
            Some(k) => out.strokes.push(k),
            None => out.unknown.push(c),
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn letters_and_digits() {
        assert_eq!(key_for('a'), Some(KeyStroke::plain(0x04)));
        assert_eq!(key_for('z'), Some(KeyStroke::plain(0x1d)));
        assert_eq!(key_for('Q'), Some(KeyStroke::shifted(0x14)));
        assert_eq!(key_for('1'), Some(KeyStroke::plain(0x1e)));
        assert_eq!(key_for('9'), Some(KeyStroke::plain(0x26)));
        assert_eq!(key_for('0'), Some(KeyStroke::plain(0x27)));
        assert_eq!(key_for('!'), Some(KeyStroke::shifted(0x1e)));
        assert_eq!(key_for(')'), Some(KeyStroke::shifted(0x27)));
    }

    #[test]
    fn shifted_chord_leads_with_shift() {
        assert_eq!(key_for('A').unwrap().chord(), vec![KEY_LEFT_SHIFT, 0x04]);
        assert_eq!(key_for('a').unwrap().chord(), vec![0x04]);
    }

    #[test]
    fn command_line() {
        let t = translate("ls -l /\n");
        let codes: Vec<u32> = t.strokes.iter().map(|k| k.code).collect();
        assert_eq!(
            codes,
            [0x0f, 0x16, KEY_SPACE, 0x2d, 0x0f, KEY_SPACE, 0x38, KEY_ENTER]
        );
        assert!(t.unknown.is_empty());
    }

    #[test]
    fn unknown_characters_are_reported() {
        let t = translate("héllo€");
        assert_eq!(t.strokes.len(), 4);
        assert_eq!(t.unknown, ['é', '€']);
    }
}
