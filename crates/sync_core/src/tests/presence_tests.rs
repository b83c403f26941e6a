use super::*;
use chrono::TimeZone;

fn remote() -> PeerId {
    PeerId::new("socks@gmail.com")
}

fn at(second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 10, 9, 0, second).unwrap()
}

fn member(user: &str, online_at: Option<DateTime<Utc>>) -> PresenceMember {
    PresenceMember {
        user: PeerId::new(user),
        online_at,
    }
}

#[test]
fn snapshot_presence_drives_the_online_flag() {
    let mut tracker = PresenceTracker::new(remote(), None);
    assert!(!tracker.view().online);

    assert!(tracker.apply_snapshot(&[member("socks@gmail.com", None)], at(1)));
    assert!(tracker.view().online);

    assert!(tracker.apply_snapshot(&[], at(2)));
    assert!(!tracker.view().online);
}

#[test]
fn transition_to_online_prefers_the_self_reported_timestamp() {
    let mut tracker = PresenceTracker::new(remote(), None);
    tracker.apply_snapshot(&[member("socks@gmail.com", Some(at(5)))], at(20));
    assert_eq!(tracker.view().last_active_at, Some(at(5)));
}

#[test]
fn transition_to_online_falls_back_to_receipt_time() {
    let mut tracker = PresenceTracker::new(remote(), None);
    tracker.apply_snapshot(&[member("socks@gmail.com", None)], at(20));
    assert_eq!(tracker.view().last_active_at, Some(at(20)));
}

#[test]
fn repeated_snapshots_bump_last_active_monotonically() {
    let mut tracker = PresenceTracker::new(remote(), None);
    tracker.apply_snapshot(&[member("socks@gmail.com", Some(at(10)))], at(10));
    tracker.apply_snapshot(&[member("socks@gmail.com", Some(at(30)))], at(30));
    assert_eq!(tracker.view().last_active_at, Some(at(30)));

    // an older self-report never rolls the clock back
    tracker.apply_snapshot(&[member("socks@gmail.com", Some(at(1)))], at(40));
    assert_eq!(tracker.view().last_active_at, Some(at(30)));
}

#[test]
fn going_offline_keeps_last_active() {
    let mut tracker = PresenceTracker::new(remote(), None);
    tracker.apply_snapshot(&[member("socks@gmail.com", Some(at(10)))], at(10));
    tracker.apply_snapshot(&[], at(20));
    let view = tracker.view();
    assert!(!view.online);
    assert_eq!(view.last_active_at, Some(at(10)));
}

#[test]
fn typing_is_independent_of_online_state() {
    let mut tracker = PresenceTracker::new(remote(), None);
    tracker.apply_snapshot(&[member("socks@gmail.com", None)], at(1));
    tracker.apply_snapshot(&[], at(2));

    // typing signal arriving between snapshots still lands
    assert!(tracker.set_typing(true));
    let view = tracker.view();
    assert!(view.typing);
    assert!(!view.online);

    // snapshots never clear typing
    tracker.apply_snapshot(&[], at(3));
    assert!(tracker.view().typing);

    assert!(tracker.set_typing(false));
    assert!(!tracker.set_typing(false));
}

#[test]
fn snapshot_matching_ignores_case_and_whitespace() {
    let mut tracker = PresenceTracker::new(PeerId::new("Socks@Gmail.com"), None);
    tracker.apply_snapshot(&[member("  SOCKS@GMAIL.COM ", None)], at(1));
    assert!(tracker.view().online);
}

#[test]
fn activity_seeds_from_cache_and_never_regresses() {
    let mut tracker = PresenceTracker::new(remote(), Some(at(50)));
    assert_eq!(tracker.view().last_active_at, Some(at(50)));
    assert!(!tracker.note_activity(at(10)));
    assert!(tracker.note_activity(at(55)));
    assert_eq!(tracker.view().last_active_at, Some(at(55)));
}
