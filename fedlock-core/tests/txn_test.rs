use fedlock_core::{AdapterRegistry, Error, LockMode, SchemaTranslator, TransactionManager};
use std::sync::Arc;
use std::time::Duration;

mod common;
use common::*;

fn sql(statements: &[&str]) -> Vec<String> {
    statements.iter().map(|s| s.to_string()).collect()
}

#[test]
fn execute_across_storages() {
    init();
    let h = open(config()).unwrap();

    let outcome = h
        .manager
        .execute(&sql(&[
            "SELECT name FROM shop.users WHERE id = 1;",
            "INSERT INTO shop.events (id, kind) VALUES (7, 'login')",
        ]))
        .unwrap();
    assert_eq!(outcome.statements.len(), 2);
    assert_eq!(outcome.statements[0].results[0].storage, "mysql0");
    assert_eq!(outcome.statements[1].results[0].storage, "mongo0");

    assert_eq!(
        h.adapter("mysql0").executed(),
        vec!["SELECT name FROM shop.users WHERE id = 1".to_owned()]
    );
    let command: serde_json::Value =
        serde_json::from_str(&h.adapter("mongo0").executed()[0]).unwrap();
    assert_eq!(command["insert"], "events");

    let lm = h.manager.lock_manager();
    assert_eq!(lm.lock_count(outcome.txn_id), 0);
    for target in [db("shop"), table("shop", "users"), record("shop", "events", "7")] {
        assert_eq!(mode_of(lm, &target), None, "{target}");
    }
}

#[test]
fn statement_waits_for_conflicting_holder() {
    init();
    let h = open(config()).unwrap();
    let users = table("shop", "users");

    let holder = h.manager.begin();
    assert!(holder.submit(&users, LockMode::Exclusive).unwrap());

    let ticket = h
        .manager
        .submit(sql(&["UPDATE shop.users SET name = 'x' WHERE id = 1"]))
        .unwrap();
    let lm = h.manager.lock_manager().clone();
    assert!(eventually(Duration::from_secs(2), || {
        lm.snapshot(&users).map_or(false, |s| !s.waiters.is_empty())
    }));
    assert!(h.adapter("mysql0").executed().is_empty());

    holder.release();
    let outcome = ticket.wait().unwrap();
    assert_eq!(outcome.statements.len(), 1);
    assert_eq!(h.adapter("mysql0").executed().len(), 1);
    assert_eq!(mode_of(&lm, &users), None);
}

#[test]
fn abort_stops_waiting_statement() {
    init();
    let h = open(config()).unwrap();
    let users = table("shop", "users");

    let holder = h.manager.begin();
    assert!(holder.submit(&users, LockMode::Shared).unwrap());

    let ticket = h
        .manager
        .submit(sql(&["DELETE FROM shop.users WHERE id = 3"]))
        .unwrap();
    let txn_id = ticket.txn_id();
    let lm = h.manager.lock_manager().clone();
    assert!(eventually(Duration::from_secs(2), || lm.graph().is_waiting(txn_id)));

    h.manager.abort(txn_id);
    assert!(matches!(ticket.wait(), Err(Error::TxnAborted(id)) if id == txn_id));
    assert!(h.adapter("mysql0").executed().is_empty());
    assert_eq!(lm.snapshot(&users).unwrap().waiters, vec![]);
    assert_eq!(lm.held_mode(holder.id(), &users), Some(LockMode::Shared));
}

#[test]
fn storage_failure_still_releases() {
    init();
    let h = open(config()).unwrap();
    let lm = h.manager.lock_manager();

    h.adapter("mysql0").fail(Some("connection reset"));
    let res = h
        .manager
        .execute(&sql(&["UPDATE shop.users SET name = 'x' WHERE id = 1"]));
    assert!(matches!(
        res,
        Err(Error::StorageExecution { ref storage, .. }) if storage == "mysql0"
    ));
    assert_eq!(mode_of(lm, &table("shop", "users")), None);
    assert_eq!(mode_of(lm, &record("shop", "users", "1")), None);
    assert_eq!(lm.graph().edge_count(), 0);

    h.adapter("mysql0").fail(None);
    h.manager
        .execute(&sql(&["UPDATE shop.users SET name = 'x' WHERE id = 1"]))
        .unwrap();
}

#[test]
fn lock_wait_timeout() {
    init();
    let mut config = config();
    config.lock.lock_wait_timeout_ms = Some(50);
    let h = open(config).unwrap();
    let users = table("shop", "users");

    let holder = h.manager.begin();
    assert!(holder.submit(&users, LockMode::Exclusive).unwrap());

    let res = h.manager.execute(&sql(&["SELECT * FROM shop.users"]));
    assert!(matches!(res, Err(Error::LockTimeout(_))));
    let lm = h.manager.lock_manager();
    assert_eq!(lm.snapshot(&users).unwrap().waiters, vec![]);
    assert_eq!(mode_of(lm, &users), Some(LockMode::Exclusive));
}

#[test]
fn rejected_statement() {
    init();
    let h = open(config()).unwrap();
    assert!(matches!(
        h.manager.execute(&sql(&["DROP TABLE shop.users"])),
        Err(Error::Translate(_))
    ));
    assert!(matches!(
        h.manager.execute(&sql(&["SELECT * FROM shop.orders"])),
        Err(Error::Translate(_))
    ));
}

#[test]
fn rejected_statement_runs_nothing() {
    init();
    let h = open(config()).unwrap();

    let res = h.manager.execute(&sql(&[
        "UPDATE shop.users SET name = 'x' WHERE id = 1",
        "DROP TABLE shop.users",
    ]));
    assert!(matches!(res, Err(Error::Translate(_))));
    assert!(h.adapter("mysql0").executed().is_empty());

    let lm = h.manager.lock_manager();
    for target in [db("shop"), table("shop", "users"), record("shop", "users", "1")] {
        assert_eq!(mode_of(lm, &target), None, "{target}");
    }
    assert_eq!(lm.graph().edge_count(), 0);
}

#[test]
fn failed_statement_stops_waiting_sibling() {
    init();
    let mut config = config();
    // bounds the test if the sibling is never woken
    config.lock.lock_wait_timeout_ms = Some(2000);
    let h = open(config).unwrap();
    let events = table("shop", "events");

    let holder = h.manager.begin();
    assert!(holder.submit(&events, LockMode::Exclusive).unwrap());
    h.adapter("mysql0").fail(Some("connection reset"));

    let res = h.manager.execute(&sql(&[
        "UPDATE shop.users SET name = 'x' WHERE id = 1",
        "DELETE FROM shop.events WHERE id = 3",
    ]));
    assert!(matches!(
        res,
        Err(Error::StorageExecution { ref storage, .. }) if storage == "mysql0"
    ));
    assert!(h.adapter("mongo0").executed().is_empty());

    let lm = h.manager.lock_manager();
    assert_eq!(lm.snapshot(&events).unwrap().waiters, vec![]);
    assert_eq!(mode_of(lm, &events), Some(LockMode::Exclusive));
    assert_eq!(mode_of(lm, &table("shop", "users")), None);
}

#[test]
fn many_transactions_on_the_pool() {
    init();
    let h = open(config()).unwrap();

    let tickets: Vec<_> = (0..16)
        .map(|i| {
            let statements = sql(&[
                &format!("UPDATE shop.users SET name = 'n{i}' WHERE id = {}", i % 4),
                "SELECT * FROM shop.events",
            ]);
            h.manager.submit(statements).unwrap()
        })
        .collect();
    let mut ids = vec![];
    for ticket in tickets {
        let outcome = ticket.wait().unwrap();
        assert_eq!(outcome.statements.len(), 2);
        ids.push(outcome.txn_id);
    }
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 16);
    assert_eq!(h.adapter("mysql0").executed().len(), 16);
    assert_eq!(h.adapter("mongo0").executed().len(), 16);
    assert_eq!(h.manager.lock_manager().graph().edge_count(), 0);
}

#[test]
fn detector_breaks_deadlock_between_transactions() {
    init();
    let h = open(config()).unwrap();
    let users = table("shop", "users");
    let events = table("shop", "events");

    let older = h.manager.begin();
    let younger = h.manager.begin();
    assert!(older.submit(&users, LockMode::Exclusive).unwrap());
    assert!(younger.submit(&events, LockMode::Exclusive).unwrap());
    assert!(!older.submit(&events, LockMode::Exclusive).unwrap());
    assert!(!younger.submit(&users, LockMode::Exclusive).unwrap());

    let (a, b) = std::thread::scope(|s| {
        let a = s.spawn(|| older.wait_for(&[(events.clone(), LockMode::Exclusive)]));
        let b = s.spawn(|| younger.wait_for(&[(users.clone(), LockMode::Exclusive)]));
        (a.join().unwrap(), b.join().unwrap())
    });
    assert!(a.is_ok());
    assert!(matches!(b, Err(Error::Deadlock { txn_id, .. }) if txn_id == younger.id()));
    assert!(eventually(Duration::from_secs(1), || {
        h.manager.deadlock_stats().victims_aborted == 1
    }));
}

#[test]
fn open_requires_matching_adapters() {
    init();
    let config = config();
    let translator = Arc::new(SchemaTranslator::new(config.clone()));
    let res = TransactionManager::open(&config, translator, AdapterRegistry::new());
    assert!(matches!(res, Err(Error::Config(_))));
}
