//! Clipboard subchannel.
//!
//! Token-based ownership per selection: whoever holds the token owns the
//! selection's contents and answers data requests. Direction restrictions
//! filter both token grants and data movement, and a loop detector
//! suspends the channel when two sides start bouncing grants at each
//! other.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use bytes::Bytes;
use log::warn;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::message::ClipboardDirection;

pub const SELECTIONS: [&str; 3] = ["CLIPBOARD", "PRIMARY", "SECONDARY"];

/// Grants per second that trip the loop detector...
const LOOP_GRANTS_PER_SEC: usize = 10;
/// ...when sustained for this long.
const LOOP_SUSTAIN: Duration = Duration::from_secs(3);
/// How long a tripped channel stays suspended.
const LOOP_SUSPEND: Duration = Duration::from_secs(5);

/// Outstanding data requests time out after this.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TokenState {
    #[default]
    NoToken,
    TokenHeld,
    TokenRequested,
}

#[derive(Debug, Default)]
struct SelectionState {
    token: TokenState,
    /// Pending outbound data requests: request id -> issue time.
    requests: HashMap<u64, Instant>,
}

#[derive(Debug)]
pub struct ClipboardChannel {
    direction: ClipboardDirection,
    selections: HashMap<&'static str, SelectionState>,
    grants: VecDeque<Instant>,
    /// First instant the grant rate went over the limit, if it still is.
    over_rate_since: Option<Instant>,
    suspended_until: Option<Instant>,
    next_request_id: u64,
}

/// What the session should do in response to a clipboard event.
#[derive(Debug, PartialEq, Eq)]
pub enum ClipboardAction {
    /// Forward a token grant to the peer side.
    ForwardToken { selection: &'static str },
    /// Ask the current owner for the data of `selection`.
    RequestData {
        request_id: u64,
        selection: &'static str,
        target: String,
    },
    /// Deliver data to the requesting side.
    DeliverData {
        request_id: u64,
        selection: &'static str,
        data: Bytes,
    },
}

fn canonical(selection: &str) -> Result<&'static str> {
    SELECTIONS
        .iter()
        .find(|s| **s == selection)
        .copied()
        .ok_or_else(|| Error::ErrBadPacket {
            packet_type: "clipboard-token".into(),
            reason: format!("unknown selection `{selection}`"),
        })
}

impl ClipboardChannel {
    pub fn new(direction: ClipboardDirection) -> ClipboardChannel {
        ClipboardChannel {
            direction,
            selections: SELECTIONS
                .iter()
                .map(|s| (*s, SelectionState::default()))
                .collect(),
            grants: VecDeque::new(),
            over_rate_since: None,
            suspended_until: None,
            next_request_id: 1,
        }
    }

    pub fn direction(&self) -> ClipboardDirection {
        self.direction
    }

    pub fn set_direction(&mut self, direction: ClipboardDirection) {
        self.direction = direction;
    }

    pub fn token_state(&self, selection: &str) -> TokenState {
        canonical(selection)
            .ok()
            .and_then(|s| self.selections.get(s))
            .map(|s| s.token)
            .unwrap_or_default()
    }

    pub fn is_suspended(&self, now: Instant) -> bool {
        self.suspended_until.is_some_and(|t| t > now)
    }

    fn note_grant(&mut self, now: Instant) -> bool {
        self.grants.push_back(now);
        while let Some(t) = self.grants.front() {
            if now.saturating_duration_since(*t) > Duration::from_secs(1) {
                self.grants.pop_front();
            } else {
                break;
            }
        }
        if self.grants.len() > LOOP_GRANTS_PER_SEC {
            let since = *self.over_rate_since.get_or_insert(now);
            if now.saturating_duration_since(since) >= LOOP_SUSTAIN {
                warn!("clipboard loop detected, suspending the channel");
                self.suspended_until = Some(now + LOOP_SUSPEND);
                self.over_rate_since = None;
                self.grants.clear();
                return false;
            }
        } else {
            self.over_rate_since = None;
        }
        true
    }

    /// The client announced ownership of a selection (client → server
    /// grant direction).
    pub fn client_token(
        &mut self,
        selection: &str,
        now: Instant,
    ) -> Result<Vec<ClipboardAction>> {
        let selection = canonical(selection)?;
        if self.is_suspended(now) || !self.note_grant(now) {
            return Ok(vec![]);
        }
        if matches!(
            self.direction,
            ClipboardDirection::ToClient | ClipboardDirection::Disabled
        ) {
            return Err(Error::ErrClipboardDirection);
        }
        let state = self.selections.get_mut(selection).expect("known selection");
        state.token = TokenState::TokenHeld;
        Ok(vec![ClipboardAction::ForwardToken { selection }])
    }

    /// The server-side backend took ownership (server → client direction).
    pub fn backend_token(
        &mut self,
        selection: &str,
        now: Instant,
    ) -> Result<Vec<ClipboardAction>> {
        let selection = canonical(selection)?;
        if self.is_suspended(now) || !self.note_grant(now) {
            return Ok(vec![]);
        }
        if matches!(
            self.direction,
            ClipboardDirection::ToServer | ClipboardDirection::Disabled
        ) {
            return Err(Error::ErrClipboardDirection);
        }
        let state = self.selections.get_mut(selection).expect("known selection");
        state.token = TokenState::NoToken;
        Ok(vec![ClipboardAction::ForwardToken { selection }])
    }

    /// The local side wants the contents of a client-held selection.
    pub fn request_data(
        &mut self,
        selection: &str,
        target: &str,
        now: Instant,
    ) -> Result<Vec<ClipboardAction>> {
        let selection = canonical(selection)?;
        if self.is_suspended(now) {
            return Ok(vec![]);
        }
        if matches!(
            self.direction,
            ClipboardDirection::ToClient | ClipboardDirection::Disabled
        ) {
            return Err(Error::ErrClipboardDirection);
        }
        let state = self.selections.get_mut(selection).expect("known selection");
        if state.token != TokenState::TokenHeld {
            return Ok(vec![]);
        }
        state.token = TokenState::TokenRequested;
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        state.requests.insert(request_id, now);
        Ok(vec![ClipboardAction::RequestData {
            request_id,
            selection,
            target: target.to_owned(),
        }])
    }

    /// Data arrived for an outstanding request.
    pub fn data_received(
        &mut self,
        request_id: u64,
        selection: &str,
        data: Bytes,
        now: Instant,
    ) -> Result<Vec<ClipboardAction>> {
        let selection = canonical(selection)?;
        let state = self.selections.get_mut(selection).expect("known selection");
        match state.requests.remove(&request_id) {
            Some(issued) if now.saturating_duration_since(issued) <= REQUEST_TIMEOUT => {
                if state.token == TokenState::TokenRequested {
                    state.token = TokenState::TokenHeld;
                }
                Ok(vec![ClipboardAction::DeliverData {
                    request_id,
                    selection,
                    data,
                }])
            }
            Some(_) => {
                warn!("clipboard request {request_id} answered after its timeout");
                Ok(vec![])
            }
            None => Ok(vec![]),
        }
    }

    /// Drops requests past their timeout; returns the expired ids.
    pub fn expire_requests(&mut self, now: Instant) -> Vec<u64> {
        let mut expired = vec![];
        for state in self.selections.values_mut() {
            state.requests.retain(|id, issued| {
                if now.saturating_duration_since(*issued) > REQUEST_TIMEOUT {
                    expired.push(*id);
                    false
                } else {
                    true
                }
            });
            if state.token == TokenState::TokenRequested && !expired.is_empty() {
                state.token = TokenState::TokenHeld;
            }
        }
        expired
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_token_flow() {
        let mut clipboard = ClipboardChannel::new(ClipboardDirection::Both);
        let now = Instant::now();
        assert_eq!(clipboard.token_state("CLIPBOARD"), TokenState::NoToken);

        let actions = clipboard.client_token("CLIPBOARD", now).unwrap();
        assert_eq!(
            actions,
            vec![ClipboardAction::ForwardToken {
                selection: "CLIPBOARD"
            }]
        );
        assert_eq!(clipboard.token_state("CLIPBOARD"), TokenState::TokenHeld);
        // Other selections are untouched.
        assert_eq!(clipboard.token_state("PRIMARY"), TokenState::NoToken);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_response_cycle() {
        let mut clipboard = ClipboardChannel::new(ClipboardDirection::Both);
        let now = Instant::now();
        clipboard.client_token("PRIMARY", now).unwrap();

        let actions = clipboard.request_data("PRIMARY", "UTF8_STRING", now).unwrap();
        let request_id = match actions[0] {
            ClipboardAction::RequestData { request_id, .. } => request_id,
            _ => panic!(),
        };
        assert_eq!(clipboard.token_state("PRIMARY"), TokenState::TokenRequested);

        let actions = clipboard
            .data_received(request_id, "PRIMARY", Bytes::from_static(b"hello"), now)
            .unwrap();
        assert!(matches!(
            actions[0],
            ClipboardAction::DeliverData { request_id: id, .. } if id == request_id
        ));
        assert_eq!(clipboard.token_state("PRIMARY"), TokenState::TokenHeld);
    }

    #[tokio::test(start_paused = true)]
    async fn test_direction_filtering() {
        let now = Instant::now();
        let mut to_client_only = ClipboardChannel::new(ClipboardDirection::ToClient);
        assert!(matches!(
            to_client_only.client_token("CLIPBOARD", now),
            Err(Error::ErrClipboardDirection)
        ));
        assert!(to_client_only.backend_token("CLIPBOARD", now).is_ok());

        let mut to_server_only = ClipboardChannel::new(ClipboardDirection::ToServer);
        assert!(to_server_only.client_token("CLIPBOARD", now).is_ok());
        assert!(matches!(
            to_server_only.backend_token("CLIPBOARD", now),
            Err(Error::ErrClipboardDirection)
        ));

        let mut disabled = ClipboardChannel::new(ClipboardDirection::Disabled);
        assert!(disabled.client_token("CLIPBOARD", now).is_err());
        assert!(disabled.backend_token("CLIPBOARD", now).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_selection() {
        let mut clipboard = ClipboardChannel::new(ClipboardDirection::Both);
        assert!(clipboard.client_token("TERTIARY", Instant::now()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_detector_suspends() {
        let mut clipboard = ClipboardChannel::new(ClipboardDirection::Both);
        let start = Instant::now();
        // Hammer grants above the rate limit for longer than the sustain
        // window: ~20 grants/s for 4 seconds.
        let mut suspended = false;
        for i in 0..80u64 {
            let now = start + Duration::from_millis(i * 50);
            clipboard.client_token("CLIPBOARD", now).unwrap();
            if clipboard.is_suspended(now) {
                suspended = true;
                break;
            }
        }
        assert!(suspended, "loop detector never tripped");

        // While suspended, grants are swallowed.
        let during = start + Duration::from_secs(5);
        if clipboard.is_suspended(during) {
            assert!(clipboard.client_token("CLIPBOARD", during).unwrap().is_empty());
        }
        // Long after, the channel recovers.
        let after = start + Duration::from_secs(60);
        assert!(!clipboard.is_suspended(after));
        assert!(!clipboard.client_token("CLIPBOARD", after).unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout() {
        let mut clipboard = ClipboardChannel::new(ClipboardDirection::Both);
        let now = Instant::now();
        clipboard.client_token("CLIPBOARD", now).unwrap();
        let actions = clipboard.request_data("CLIPBOARD", "UTF8_STRING", now).unwrap();
        let request_id = match actions[0] {
            ClipboardAction::RequestData { request_id, .. } => request_id,
            _ => panic!(),
        };

        let late = now + REQUEST_TIMEOUT + Duration::from_secs(1);
        let expired = clipboard.expire_requests(late);
        assert_eq!(expired, vec![request_id]);
        // A late answer is dropped.
        assert!(clipboard
            .data_received(request_id, "CLIPBOARD", Bytes::new(), late)
            .unwrap()
            .is_empty());
    }
}
