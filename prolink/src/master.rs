//! Tempo-master tracking and handoff-request bookkeeping.

use std::time::Duration;

use tokio::time::Instant;

use crate::message::StatusInfo;

/// Sentinel device number meaning "nobody".
pub(crate) const NO_DEVICE: u8 = 0xff;

/// Retry/timeout policy for master handoff requests.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RequestPolicy {
    pub retry_interval: Duration,
    pub timeout: Duration,
    pub max_retries: u32,
}

/// An outstanding handoff request to the current master.
#[derive(Clone, Copy, Debug)]
pub(crate) struct MasterRequest {
    pub target: u8,
    pub first_attempt: Instant,
    pub last_attempt: Instant,
    pub attempts: u32,
}

/// Outcome of asking for the master role.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RoleRequest {
    /// No master on the network; promote ourselves immediately.
    SelfPromote,
    /// The tracked master is already our own device number.
    AlreadyOurs,
    /// Send a handoff request to this device.
    Send(u8),
    /// An identical request is still inside its retry interval.
    Throttled,
}

/// Tracks the network's tempo master, our outstanding handoff request, and
/// the successor we promised the role to.
pub(crate) struct MasterHandoff {
    master_status: Option<StatusInfo>,
    master_device: u8,
    master_beat: u32,
    /// Device we accepted a handoff request from, or [`NO_DEVICE`].
    pub handoff_to: u8,
    request: Option<MasterRequest>,
}

impl MasterHandoff {
    pub fn new() -> MasterHandoff {
        MasterHandoff {
            master_status: None,
            master_device: 0,
            master_beat: 0,
            handoff_to: NO_DEVICE,
            request: None,
        }
    }

    pub fn master_status(&self) -> Option<&StatusInfo> {
        self.master_status.as_ref()
    }

    pub fn master_device(&self) -> u8 {
        self.master_device
    }

    pub fn request(&self) -> Option<&MasterRequest> {
        self.request.as_ref()
    }

    /// Start (or refuse to start) a handoff request toward the tracked
    /// master.
    pub fn begin_request(
        &mut self,
        our_device: u8,
        retry_interval: Duration,
        now: Instant,
    ) -> RoleRequest {
        let target = match &self.master_status {
            None => {
                self.request = None;
                return RoleRequest::SelfPromote;
            }
            Some(status) => status.device_number,
        };
        if target == our_device {
            self.request = None;
            return RoleRequest::AlreadyOurs;
        }
        if let Some(request) = &self.request {
            if request.target == target
                && now.saturating_duration_since(request.last_attempt) < retry_interval
            {
                return RoleRequest::Throttled;
            }
        }
        self.request = Some(MasterRequest {
            target,
            first_attempt: now,
            last_attempt: now,
            attempts: 1,
        });
        RoleRequest::Send(target)
    }

    /// Drive the retry/timeout schedule. Returns the target to re-send to,
    /// if a retry is due. An exhausted or timed-out request is abandoned.
    pub fn maybe_retry(&mut self, policy: &RequestPolicy, now: Instant) -> Option<u8> {
        let request = self.request?;
        if now.saturating_duration_since(request.first_attempt) >= policy.timeout {
            self.request = None;
            return None;
        }
        if request.attempts >= policy.max_retries.max(1) {
            return None;
        }
        if now.saturating_duration_since(request.last_attempt) >= policy.retry_interval {
            self.request = Some(MasterRequest {
                last_attempt: now,
                attempts: request.attempts + 1,
                ..request
            });
            return Some(request.target);
        }
        None
    }

    /// Track a status packet whose master flag is set. When a different
    /// master appears mid-request, the request restarts against it with a
    /// fresh attempt budget; the returned device should be sent a new
    /// handoff request.
    pub fn observe_master(&mut self, info: &StatusInfo, our_device: u8, now: Instant) -> Option<u8> {
        let mut restart = None;
        if let Some(request) = self.request {
            if request.target != info.device_number {
                if info.device_number == our_device {
                    self.request = None;
                } else {
                    self.request = Some(MasterRequest {
                        target: info.device_number,
                        first_attempt: now,
                        last_attempt: now,
                        attempts: 1,
                    });
                    restart = Some(info.device_number);
                }
            }
        }
        self.master_status = Some(info.clone());
        self.master_device = info.device_number;
        if let Some(beat) = info.beat {
            self.master_beat = beat;
        }
        restart
    }

    /// A status packet pointed its handoff byte at us; the role is ours.
    pub fn take_role(&mut self) {
        self.request = None;
    }

    /// Our promised successor now advertises itself as master.
    pub fn complete_handoff(&mut self) {
        self.handoff_to = NO_DEVICE;
        self.request = None;
    }

    /// Step the expected master beat forward for a beat packet from the
    /// master. Returns the new beat number, or `None` before any status
    /// packet carried an absolute beat.
    pub fn advance_master_beat(&mut self) -> Option<u32> {
        if self.master_beat == 0 {
            return None;
        }
        self.master_beat += 1;
        Some(self.master_beat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::NEUTRAL_PITCH;

    fn master_status(device_number: u8) -> StatusInfo {
        StatusInfo {
            device_number,
            device_name: format!("CDJ-{}", device_number),
            bpm: Some(12000),
            pitch: NEUTRAL_PITCH,
            beat: Some(64),
            beat_within_bar: 1,
            master_handoff_to: NO_DEVICE,
            is_master: true,
            is_synced: true,
            is_playing: true,
        }
    }

    fn policy() -> RequestPolicy {
        RequestPolicy {
            retry_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(5),
            max_retries: 3,
        }
    }

    #[test]
    fn no_known_master_self_promotes() {
        let mut handoff = MasterHandoff::new();
        let outcome = handoff.begin_request(7, Duration::from_secs(1), Instant::now());
        assert_eq!(outcome, RoleRequest::SelfPromote);
        assert!(handoff.request().is_none());
    }

    #[test]
    fn known_master_is_requested() {
        let mut handoff = MasterHandoff::new();
        let now = Instant::now();
        handoff.observe_master(&master_status(2), 7, now);

        assert_eq!(
            handoff.begin_request(7, Duration::from_secs(1), now),
            RoleRequest::Send(2)
        );
        let request = handoff.request().unwrap();
        assert_eq!(request.target, 2);
        assert_eq!(request.attempts, 1);

        // Asking again right away is throttled.
        assert_eq!(
            handoff.begin_request(7, Duration::from_secs(1), now),
            RoleRequest::Throttled
        );
    }

    #[test]
    fn master_already_ours() {
        let mut handoff = MasterHandoff::new();
        let now = Instant::now();
        handoff.observe_master(&master_status(7), 7, now);
        assert_eq!(
            handoff.begin_request(7, Duration::from_secs(1), now),
            RoleRequest::AlreadyOurs
        );
    }

    #[test]
    fn retry_schedule_counts_attempts() {
        let mut handoff = MasterHandoff::new();
        let start = Instant::now();
        handoff.observe_master(&master_status(2), 7, start);
        handoff.begin_request(7, policy().retry_interval, start);

        assert_eq!(handoff.maybe_retry(&policy(), start), None);
        assert_eq!(
            handoff.maybe_retry(&policy(), start + Duration::from_secs(1)),
            Some(2)
        );
        assert_eq!(
            handoff.maybe_retry(&policy(), start + Duration::from_secs(2)),
            Some(2)
        );
        assert_eq!(handoff.request().unwrap().attempts, 3);

        // Attempt budget exhausted.
        assert_eq!(
            handoff.maybe_retry(&policy(), start + Duration::from_secs(3)),
            None
        );
        assert!(handoff.request().is_some());

        // Overall timeout abandons the request entirely.
        assert_eq!(
            handoff.maybe_retry(&policy(), start + Duration::from_secs(5)),
            None
        );
        assert!(handoff.request().is_none());
    }

    #[test]
    fn new_master_mid_request_restarts_attempts() {
        let mut handoff = MasterHandoff::new();
        let start = Instant::now();
        handoff.observe_master(&master_status(2), 7, start);
        handoff.begin_request(7, policy().retry_interval, start);
        handoff.maybe_retry(&policy(), start + Duration::from_secs(1));
        assert_eq!(handoff.request().unwrap().attempts, 2);

        let later = start + Duration::from_millis(1500);
        let restart = handoff.observe_master(&master_status(3), 7, later);
        assert_eq!(restart, Some(3));
        let request = handoff.request().unwrap();
        assert_eq!(request.target, 3);
        assert_eq!(request.attempts, 1);
        assert_eq!(request.first_attempt, later);
    }

    #[test]
    fn observing_ourselves_as_master_clears_request() {
        let mut handoff = MasterHandoff::new();
        let now = Instant::now();
        handoff.observe_master(&master_status(2), 7, now);
        handoff.begin_request(7, Duration::from_secs(1), now);

        assert_eq!(handoff.observe_master(&master_status(7), 7, now), None);
        assert!(handoff.request().is_none());
    }

    #[test]
    fn master_beat_advances_only_once_known() {
        let mut handoff = MasterHandoff::new();
        assert_eq!(handoff.advance_master_beat(), None);

        let mut status = master_status(2);
        status.beat = Some(10);
        handoff.observe_master(&status, 7, Instant::now());
        assert_eq!(handoff.advance_master_beat(), Some(11));
        assert_eq!(handoff.advance_master_beat(), Some(12));
    }
}
