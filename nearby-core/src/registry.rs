//! Presence registry: live roster of resolved peers with time-based invalidation.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::identity::PeerId;
use crate::profile::Profile;

/// What a merge did to the roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// New peer.
    Inserted,
    /// Known peer whose name, avatar or signal changed.
    Updated,
    /// Known peer, same content; only `last_seen` moved.
    Refreshed,
}

impl MergeOutcome {
    /// Observable roster content changed.
    pub fn changed(self) -> bool {
        !matches!(self, MergeOutcome::Refreshed)
    }
}

/// Roster keyed by profile identifier.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    entries: HashMap<PeerId, Profile>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&mut self, mut profile: Profile, now: Instant) -> MergeOutcome {
        profile.last_seen = now;
        match self.entries.get_mut(&profile.identifier) {
            Some(existing) if existing.same_content(&profile) => {
                existing.last_seen = now;
                MergeOutcome::Refreshed
            }
            Some(existing) => {
                *existing = profile;
                MergeOutcome::Updated
            }
            None => {
                self.entries.insert(profile.identifier.clone(), profile);
                MergeOutcome::Inserted
            }
        }
    }

    /// Drop every entry with `last_seen + window < now`. Returns whether anything was removed.
    pub fn sweep(&mut self, now: Instant, window: Duration) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|_, p| now.saturating_duration_since(p.last_seen) <= window);
        self.entries.len() != before
    }

    /// Remove everything. Returns whether the roster was non-empty.
    pub fn clear(&mut self) -> bool {
        let changed = !self.entries.is_empty();
        self.entries.clear();
        changed
    }

    /// Current roster, ordered by identifier.
    pub fn snapshot(&self) -> Vec<Profile> {
        let mut out: Vec<Profile> = self.entries.values().cloned().collect();
        out.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        out
    }

    pub fn get(&self, id: &PeerId) -> Option<&Profile> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::Avatar;

    const WINDOW: Duration = Duration::from_secs(10);

    fn profile(id: &str, name: &str, now: Instant) -> Profile {
        Profile {
            identifier: PeerId::new(id),
            display_name: name.to_owned(),
            avatar: Avatar::Placeholder,
            signal_strength: -50,
            last_seen: now,
        }
    }

    #[test]
    fn merge_inserts_then_refreshes() {
        let mut reg = PresenceRegistry::new();
        let t0 = Instant::now();
        assert_eq!(reg.merge(profile("A", "Alice", t0), t0), MergeOutcome::Inserted);

        let t1 = t0 + Duration::from_secs(2);
        let outcome = reg.merge(profile("A", "Alice", t1), t1);
        assert_eq!(outcome, MergeOutcome::Refreshed);
        assert!(!outcome.changed());
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get(&PeerId::new("A")).unwrap().last_seen, t1);
    }

    #[test]
    fn merge_replaces_changed_content() {
        let mut reg = PresenceRegistry::new();
        let t0 = Instant::now();
        reg.merge(profile("A", "Alice", t0), t0);
        assert_eq!(
            reg.merge(profile("A", "Alicia", t0), t0),
            MergeOutcome::Updated
        );
        assert_eq!(reg.snapshot()[0].display_name, "Alicia");
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn merge_stamps_now_not_payload_time() {
        let mut reg = PresenceRegistry::new();
        let t0 = Instant::now();
        let later = t0 + Duration::from_secs(30);
        reg.merge(profile("A", "Alice", t0), later);
        assert_eq!(reg.get(&PeerId::new("A")).unwrap().last_seen, later);
    }

    #[test]
    fn sweep_removes_stale_entries_only() {
        let mut reg = PresenceRegistry::new();
        let t0 = Instant::now();
        reg.merge(profile("A", "Alice", t0), t0);
        let t1 = t0 + Duration::from_secs(5);
        reg.merge(profile("B", "Bob", t1), t1);

        let now = t0 + WINDOW + Duration::from_millis(1);
        assert!(reg.sweep(now, WINDOW));
        let ids: Vec<_> = reg.snapshot().into_iter().map(|p| p.identifier).collect();
        assert_eq!(ids, vec![PeerId::new("B")]);
        assert!(!reg.sweep(now, WINDOW));
    }

    #[test]
    fn entry_exactly_at_window_survives() {
        let mut reg = PresenceRegistry::new();
        let t0 = Instant::now();
        reg.merge(profile("A", "Alice", t0), t0);
        assert!(!reg.sweep(t0 + WINDOW, WINDOW));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn clear_reports_change() {
        let mut reg = PresenceRegistry::new();
        assert!(!reg.clear());
        let t0 = Instant::now();
        reg.merge(profile("A", "Alice", t0), t0);
        assert!(reg.clear());
        assert!(reg.is_empty());
    }

    #[test]
    fn snapshot_is_sorted() {
        let mut reg = PresenceRegistry::new();
        let t0 = Instant::now();
        for id in ["C", "A", "B"] {
            reg.merge(profile(id, id, t0), t0);
        }
        let ids: Vec<String> = reg
            .snapshot()
            .iter()
            .map(|p| p.identifier.to_string())
            .collect();
        assert_eq!(ids, ["A", "B", "C"]);
    }
}
