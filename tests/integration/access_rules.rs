//! Key access rules as seen by checks

use std::time::Duration;

use hostwatch::UNSUPPORTED_KEY;
use hostwatch::access::{AccessGate, RuleError, RuleSource};
use pretty_assertions::assert_eq;

use crate::helpers::{gate, scheduler};

#[test]
fn test_default_allow_with_system_run_denied() {
    let gate = gate(&["vfs.file.contents[/var/log/*]"], &["system.run[*]"]);

    assert!(gate.check_key("vfs.file.contents[/var/log/app.log]"));
    assert!(!gate.check_key("system.run[id]"));
    assert!(gate.check_key("net.tcp.port[,80]"));
}

#[test]
fn test_trailing_wildcard_parameter() {
    let gate = gate(&[], &["vfs.file.contents[/etc/passwd,*]"]);

    assert!(!gate.check_key("vfs.file.contents[/etc/passwd]"));
    assert!(!gate.check_key("vfs.file.contents[/etc/passwd,]"));
    assert!(!gate.check_key("vfs.file.contents[/etc/passwd,utf8]"));
    assert!(gate.check_key("vfs.file.contents[/etc/passwd ]"));
    assert!(gate.check_key("vfs.file.contents[/etc/shadow]"));
}

#[test]
fn test_failed_reload_keeps_active_rules() {
    let gate = AccessGate::new();
    gate.load_rules(&[], &[RuleSource::new(1, "agent.version")]).unwrap();

    let error = gate
        .load_rules(&[], &[RuleSource::new(4, "agent.version[")])
        .unwrap_err();
    assert!(matches!(error, RuleError::InvalidPattern { line: 4, .. }));
    assert!(!gate.check_key("agent.version"));

    let error = gate
        .load_rules(&[RuleSource::new(1, "*")], &[])
        .unwrap_err();
    assert!(matches!(error, RuleError::MatchesEverything));
}

#[tokio::test]
async fn test_checks_respect_reloaded_rules() {
    let gate = gate(&[], &[]);
    let scheduler = scheduler(gate.clone());
    let wait = Duration::from_secs(2);

    let before = scheduler.check_once("agent.version", wait).await.unwrap();
    assert!(!before.value.is_error());

    gate.load_rules(&[], &[RuleSource::new(1, "agent.*")]).unwrap();
    let after = scheduler.check_once("agent.version", wait).await.unwrap();
    assert_eq!(after.error_message(), Some(UNSUPPORTED_KEY));
}
