use quern_core::PoolState;

#[test]
fn test_valid_transitions() {
    let s = PoolState::Running;
    assert!(s.is_accepting());

    let s = s.mark_as_draining().unwrap();
    assert_eq!(s, PoolState::Draining);
    assert!(!s.is_accepting());

    let s = s.mark_as_stopped().unwrap();
    assert_eq!(s, PoolState::Stopped);
    assert!(s.is_terminal());
}

#[test]
fn test_cannot_skip_draining() {
    let err = PoolState::Running.mark_as_stopped().unwrap_err();
    assert_eq!(
        err.to_string(),
        "illegal pool transition from Running to Stopped"
    );
}

#[test]
fn test_never_moves_backward() {
    assert!(PoolState::Draining.mark_as_draining().is_err());
    assert!(PoolState::Stopped.mark_as_draining().is_err());
    assert!(PoolState::Stopped.mark_as_stopped().is_err());
}

#[test]
fn test_display_matches_as_str() {
    for s in [PoolState::Running, PoolState::Draining, PoolState::Stopped] {
        assert_eq!(s.to_string(), s.as_str());
    }
}
