use agora::{
    config::Config,
    error::Error,
    function::Kwargs,
    kwargs,
    portal::Portal,
    swarm::{poll_once, PollOutcome},
};
use tempfile::TempDir;

#[agora::function(island = "X")]
fn factorial(n: u64) -> anyhow::Result<u64> {
    if n <= 1 {
        return Ok(1);
    }
    Ok(n * FACTORIAL.call::<u64>(kwargs! { n = n - 1 }?)?)
}

#[agora::function]
fn fibonacci(n: u64) -> anyhow::Result<u64> {
    Ok(match n {
        0 | 1 => n,
        _ => {
            FIBONACCI.call::<u64>(kwargs! { n = n - 1 }?)?
                + FIBONACCI.call::<u64>(kwargs! { n = n - 2 }?)?
        }
    })
}

#[agora::function]
fn greeting(portal: &Portal, name: String) -> String {
    let _ = portal.log_event(&format!("greeting {name}"));
    format!("hello, {name}")
}

fn never(_: &Portal, _: &Kwargs) -> bool {
    false
}

#[agora::function(guards(never))]
fn forbidden() -> u64 {
    unreachable!("guarded by `never`")
}

#[test]
fn declared_functions_are_registered_on_open() {
    let portal = Portal::in_memory().unwrap();
    let registry = portal.registry();
    assert!(registry.lookup("X", "factorial").is_some());
    assert!(registry.lookup("main", "fibonacci").is_some());
    assert_eq!(
        FIBONACCI.dependencies,
        &["fibonacci"],
        "self-calls are detected"
    );
    assert!(registry
        .transitive_dependencies("X", "factorial")
        .unwrap()
        .is_empty());
    portal.clear().unwrap();
}

#[test]
fn factorial_runs_once() {
    let dir = TempDir::new().unwrap();
    let portal = Portal::open(Config::at(dir.path())).unwrap();

    assert_eq!(FACTORIAL.execute::<u64>(&portal, kwargs! { n = 5u64 }.unwrap()).unwrap(), 120);
    let cached = portal.describe().unwrap().cached_results;
    assert_eq!(cached, 5);

    assert_eq!(FACTORIAL.execute::<u64>(&portal, kwargs! { n = 5u64 }.unwrap()).unwrap(), 120);
    assert_eq!(portal.describe().unwrap().cached_results, cached);
    portal.clear().unwrap();
}

#[test]
fn two_portals_converge_on_one_record() {
    let dir = TempDir::new().unwrap();
    let a = Portal::open(Config::at(dir.path())).unwrap();
    let b = Portal::open(Config::at(dir.path())).unwrap();
    let fib = FIBONACCI.function();

    let from_a = a.swarm(&fib, kwargs! { n = 10u64 }.unwrap()).unwrap();
    let from_b = b.swarm(&fib, kwargs! { n = 10u64 }.unwrap()).unwrap();
    assert_eq!(from_a, from_b);
    assert_eq!(a.pending_requests().unwrap(), vec![from_a.clone()]);

    assert_eq!(poll_once(&a).unwrap(), PollOutcome::Executed(from_a.clone()));
    assert_eq!(poll_once(&b).unwrap(), PollOutcome::Idle);
    assert_eq!(b.get::<u64>(&from_b, None).unwrap(), 55);

    let records = b.execution_records(&from_b).unwrap();
    assert_eq!(records.iter().filter(|r| r.succeeded()).count(), 1);
    assert!(b.pending_requests().unwrap().is_empty());

    a.clear().unwrap();
    b.clear().unwrap();
}

#[test]
fn portal_arguments_and_events() {
    let portal = Portal::in_memory().unwrap();
    let greeting: String = GREETING
        .execute(&portal, kwargs! { name = "agora" }.unwrap())
        .unwrap();
    assert_eq!(greeting, "hello, agora");
    assert_eq!(portal.audit().event_count().unwrap(), 1);
    portal.clear().unwrap();
}

#[test]
fn guarded_functions_are_skipped() {
    let portal = Portal::in_memory().unwrap();
    let address = portal.swarm(&FORBIDDEN.function(), Kwargs::new()).unwrap();
    assert_eq!(poll_once(&portal).unwrap(), PollOutcome::Idle);
    assert!(matches!(
        FORBIDDEN.execute::<u64>(&portal, Kwargs::new()),
        Err(Error::GuardRejected { ref guard, .. }) if guard == "never"
    ));
    assert!(portal.execution_attempts(&address).unwrap().is_empty());
    portal.clear().unwrap();
}

#[test]
fn missing_arguments_fail_the_attempt() {
    let portal = Portal::in_memory().unwrap();
    assert!(matches!(
        FACTORIAL.execute::<u64>(&portal, Kwargs::new()),
        Err(Error::ExecutionFailed { .. })
    ));
    portal.clear().unwrap();
}
