use chrono::{DateTime, Utc};

use shared::{domain::PeerId, protocol::PresenceMember};

/// What the UI reads: online flag, ephemeral typing flag, and the
/// last-active timestamp for the remote party.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceView {
    pub online: bool,
    pub typing: bool,
    pub last_active_at: Option<DateTime<Utc>>,
}

/// Tracks the remote party's presence from full-membership snapshots plus
/// activity implied by messages, receipts, and typing signals. Snapshots
/// are restated wholesale, never patched, so `apply_snapshot` recomputes
/// rather than merges.
#[derive(Debug)]
pub struct PresenceTracker {
    remote: PeerId,
    online: bool,
    typing: bool,
    last_active_at: Option<DateTime<Utc>>,
}

impl PresenceTracker {
    pub fn new(remote: PeerId, cached_last_active: Option<DateTime<Utc>>) -> Self {
        Self {
            remote: remote.normalized(),
            online: false,
            typing: false,
            last_active_at: cached_last_active,
        }
    }

    pub fn view(&self) -> PresenceView {
        PresenceView {
            online: self.online,
            typing: self.typing,
            last_active_at: self.last_active_at,
        }
    }

    /// Applies one full membership snapshot. On the offline-to-online
    /// transition the member's self-reported timestamp wins over the
    /// local receipt time; while already online a newer self-reported
    /// timestamp still bumps the last-active clock (monotonically).
    ///
    /// Typing is deliberately untouched: typing signals are ordered
    /// independently of presence syncs.
    pub fn apply_snapshot(
        &mut self,
        members: &[PresenceMember],
        received_at: DateTime<Utc>,
    ) -> bool {
        let before = self.view();
        let member = members
            .iter()
            .find(|member| member.user.normalized() == self.remote);

        match member {
            Some(member) => {
                let was_online = self.online;
                self.online = true;
                if !was_online {
                    self.bump_activity(member.online_at.unwrap_or(received_at));
                } else if let Some(online_at) = member.online_at {
                    self.bump_activity(online_at);
                }
            }
            None => {
                self.online = false;
            }
        }

        self.view() != before
    }

    /// Any inbound message, receipt, or typing signal from the remote
    /// party implies presence between snapshots.
    pub fn note_activity(&mut self, at: DateTime<Utc>) -> bool {
        self.bump_activity(at)
    }

    pub fn set_typing(&mut self, typing: bool) -> bool {
        if self.typing == typing {
            return false;
        }
        self.typing = typing;
        true
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn last_active_at(&self) -> Option<DateTime<Utc>> {
        self.last_active_at
    }

    fn bump_activity(&mut self, at: DateTime<Utc>) -> bool {
        if self.last_active_at.map_or(true, |current| at > current) {
            self.last_active_at = Some(at);
            return true;
        }
        false
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
