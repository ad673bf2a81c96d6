// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Decides whether a lifecycle request against one instance may proceed.
//!
//! Each instance keeps a disposition for every kind of request: proceed,
//! deny, or silently ignore (so repeated requests look idempotent to
//! callers). Dispositions change as requests are accepted and as the
//! instance's observed state changes, so a request that an earlier one
//! forecloses (rebooting after a destroy, say) is denied up front.
//!
//! Callers serialize access to a gate with their own lock.

use nightlight_types::PowerState;
use slog::{debug, info, Logger};
use thiserror::Error;

/// A lifecycle request made of an instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum LifecycleRequest {
    /// Powers the guest on.
    Start,
    /// Asks the guest to power itself off.
    Shutdown,
    Reboot,
    /// Hard reset without guest cooperation.
    Reset,
    /// Keyboard input and device hot-plug.
    Console,
    /// Powers the guest off and removes everything provisioned for it.
    Destroy,
}

/// Reasons a lifecycle request can be refused.
#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
pub enum RequestDeniedReason {
    #[error("Operation requires a running instance")]
    NotRunning,

    #[error("Instance is shutting down")]
    HaltPending,

    #[error("Instance is being destroyed")]
    DestroyPending,

    #[error("Instance has been destroyed")]
    Destroyed,

    #[error("Instance failed or crashed")]
    InstanceFailed,
}

/// Instance state changes that affect what requests are accepted.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InstanceStateChange {
    StartedRunning,
    Rebooted,
    Stopped,
    Failed,
    Destroyed,
}

#[derive(Debug)]
enum DispositionChangeReason {
    Request(LifecycleRequest),
    StateChange(InstanceStateChange),
}

/// How a request is handled.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RequestDisposition {
    Proceed,

    /// Succeed without doing anything.
    Ignore,

    Deny(RequestDeniedReason),
}

#[derive(Copy, Clone, Debug)]
struct AllowedRequests {
    start: RequestDisposition,
    shutdown: RequestDisposition,
    reboot: RequestDisposition,
    reset: RequestDisposition,
    console: RequestDisposition,
    destroy: RequestDisposition,
}

impl AllowedRequests {
    fn get(&self, req: LifecycleRequest) -> RequestDisposition {
        match req {
            LifecycleRequest::Start => self.start,
            LifecycleRequest::Shutdown => self.shutdown,
            LifecycleRequest::Reboot => self.reboot,
            LifecycleRequest::Reset => self.reset,
            LifecycleRequest::Console => self.console,
            LifecycleRequest::Destroy => self.destroy,
        }
    }

    fn running() -> Self {
        use RequestDisposition as D;
        Self {
            start: D::Ignore,
            shutdown: D::Proceed,
            reboot: D::Proceed,
            reset: D::Proceed,
            console: D::Proceed,
            destroy: D::Proceed,
        }
    }

    fn stopped(reason: RequestDeniedReason) -> Self {
        use RequestDisposition as D;
        Self {
            start: D::Proceed,
            shutdown: D::Ignore,
            reboot: D::Deny(reason),
            reset: D::Deny(reason),
            console: D::Deny(reason),
            destroy: D::Proceed,
        }
    }

    fn all_denied(
        reason: RequestDeniedReason,
        destroy: RequestDisposition,
    ) -> Self {
        use RequestDisposition as D;
        Self {
            start: D::Deny(reason),
            shutdown: D::Deny(reason),
            reboot: D::Deny(reason),
            reset: D::Deny(reason),
            console: D::Deny(reason),
            destroy,
        }
    }
}

#[derive(Debug)]
pub struct RequestGate {
    allowed: AllowedRequests,
    destroyed: bool,
    log: Logger,
}

impl RequestGate {
    /// A gate for an instance that has just been defined and not started.
    pub fn new(log: Logger) -> Self {
        Self {
            allowed: AllowedRequests::stopped(RequestDeniedReason::NotRunning),
            destroyed: false,
            log,
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Returns how `req` should be handled and, if it may proceed, updates
    /// the dispositions of later requests.
    pub fn admit(
        &mut self,
        req: LifecycleRequest,
    ) -> Result<RequestDisposition, RequestDeniedReason> {
        let disposition = self.allowed.get(req);
        info!(self.log, "lifecycle request";
            "request" => %req,
            "disposition" => ?disposition);

        match disposition {
            RequestDisposition::Proceed => {
                self.allowed = self.get_new_dispositions(
                    DispositionChangeReason::Request(req),
                );
                Ok(RequestDisposition::Proceed)
            }
            RequestDisposition::Ignore => Ok(RequestDisposition::Ignore),
            RequestDisposition::Deny(reason) => Err(reason),
        }
    }

    pub fn notify_instance_state_change(&mut self, state: InstanceStateChange) {
        if state == InstanceStateChange::Destroyed {
            self.destroyed = true;
        }
        self.allowed = self
            .get_new_dispositions(DispositionChangeReason::StateChange(state));
    }

    /// Brings the gate in line with a power state read from the hypervisor.
    pub fn observe(&mut self, state: PowerState) {
        if self.destroyed {
            return;
        }
        let change = match state {
            PowerState::On => {
                // A pending shutdown stays pending until the guest is off.
                if self.allowed.shutdown == RequestDisposition::Ignore
                    && self.allowed.start
                        == RequestDisposition::Deny(
                            RequestDeniedReason::HaltPending,
                        )
                {
                    return;
                }
                InstanceStateChange::StartedRunning
            }
            PowerState::Off => InstanceStateChange::Stopped,
            PowerState::Crashed => InstanceStateChange::Failed,
            PowerState::Paused | PowerState::Unknown => return,
        };
        self.notify_instance_state_change(change);
    }

    fn get_new_dispositions(
        &self,
        reason: DispositionChangeReason,
    ) -> AllowedRequests {
        debug!(self.log, "computing new request dispositions";
            "reason" => ?reason);

        use DispositionChangeReason as ChangeReason;
        use InstanceStateChange as State;
        use LifecycleRequest as Req;
        use RequestDeniedReason as DenyReason;
        use RequestDisposition as Disposition;

        // Nothing brings a destroyed instance back.
        if self.destroyed {
            return AllowedRequests::all_denied(
                DenyReason::Destroyed,
                Disposition::Ignore,
            );
        }

        match reason {
            ChangeReason::Request(Req::Start) => AllowedRequests::running(),

            // A requested shutdown blocks everything except destroy until
            // the guest is seen powered off. Repeats are ignored.
            ChangeReason::Request(Req::Shutdown) => AllowedRequests {
                shutdown: Disposition::Ignore,
                ..AllowedRequests::all_denied(
                    DenyReason::HaltPending,
                    Disposition::Proceed,
                )
            },

            ChangeReason::Request(Req::Reboot)
            | ChangeReason::Request(Req::Reset)
            | ChangeReason::Request(Req::Console) => self.allowed,

            ChangeReason::Request(Req::Destroy) => AllowedRequests::all_denied(
                DenyReason::DestroyPending,
                Disposition::Ignore,
            ),

            ChangeReason::StateChange(State::StartedRunning)
            | ChangeReason::StateChange(State::Rebooted) => {
                AllowedRequests::running()
            }
            ChangeReason::StateChange(State::Stopped) => {
                AllowedRequests::stopped(DenyReason::NotRunning)
            }
            ChangeReason::StateChange(State::Failed) => {
                AllowedRequests::stopped(DenyReason::InstanceFailed)
            }
            ChangeReason::StateChange(State::Destroyed) => {
                AllowedRequests::all_denied(
                    DenyReason::Destroyed,
                    Disposition::Ignore,
                )
            }
        }
    }
}
