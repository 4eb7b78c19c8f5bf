//! End-to-end scenarios against a running task process

use std::thread;
use std::time::{Duration, Instant};

use proptest::prelude::*;

use operant_core::{
    ChamberId, ComponentId, ErrorKind, Event, EventKind, EventType, Metadata, SourceId, Value,
};
use operant_runtime::{add_task, parse_address_map, parse_protocol, RuntimeConfig};
use operant_source::{SourceConfig, SourceProcess, VirtualSource};
use operant_task::{ChamberTask, Machine, TaskSetup, TimerLink};
use operant_time::{Timeout, TimeoutConfig, TimeoutKey, TimeoutManager};
use operant_transport::bridge;
use operant_wire::link;

use crate::*;

const C1: ChamberId = ChamberId(1);
const C2: ChamberId = ChamberId(2);
const WAIT: Duration = Duration::from_secs(2);

fn hold(ms: i64) -> Metadata {
    let mut constants = Metadata::new();
    constants.insert("hold_ms".into(), Value::Int(ms));
    constants
}

fn is_state_event(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::StateEnter { .. } | EventKind::StateExit { .. } | EventKind::TaskComplete
    )
}

fn errors_of(events: &[Event], wanted: ErrorKind) -> Vec<Event> {
    events
        .iter()
        .filter(|e| matches!(&e.kind, EventKind::Error { kind, .. } if *kind == wanted))
        .cloned()
        .collect()
}

/// Start a press task in C1 on `source` and wait until it sits in `A`
fn started_press(rig: &mut Rig, source: &str, constants: Metadata) {
    rig.add_task(C1, "press", press_bindings(source), constants)
        .unwrap();
    rig.control(C1, EventKind::Start).unwrap();
    rig.until_enter(C1, A);
    assert!(rig.wait_registered(source, 2, WAIT));
}

#[test]
fn test_start_then_stop() {
    let mut rig = Rig::launch(&["box"]).unwrap();
    rig.add_task(C1, "press", press_bindings("box"), Metadata::new())
        .unwrap();
    rig.send(&[Event::new(C1, EventKind::Start), Event::new(C1, EventKind::Stop)])
        .unwrap();

    let mut events = rig.collect_until(WAIT, |e| matches!(e.kind, EventKind::StateExit { .. }));
    events.extend(rig.collect_for(Duration::from_millis(100)));

    let states: Vec<EventKind> = events
        .iter()
        .filter(|e| is_state_event(e))
        .map(|e| e.kind.clone())
        .collect();
    assert_eq!(
        states,
        vec![EventKind::StateEnter { state: A }, EventKind::StateExit { state: A }]
    );
    assert_eq!(
        &types(&events)[..3],
        [EventType::Init, EventType::Start, EventType::StateEnter]
    );
    rig.shutdown().unwrap();
}

#[test]
fn test_leaving_state_cancels_its_timer() {
    let mut rig = Rig::launch(&["box"]).unwrap();
    started_press(&mut rig, "box", hold(2000));

    rig.set_input("box", C1, "lever", true).unwrap();
    let events = rig.collect_for(Duration::from_millis(2400));

    assert!(events.contains(&Event::new(C1, EventKind::StateEnter { state: B })));
    assert_eq!(timeouts_named(&events, "t1"), 0);
    rig.shutdown().unwrap();
}

#[test]
fn test_timer_fires_no_earlier_than_its_duration() {
    let mut rig = Rig::launch(&["box"]).unwrap();
    rig.add_task(C1, "press", press_bindings("box"), hold(100))
        .unwrap();

    let sent = Instant::now();
    rig.control(C1, EventKind::Start).unwrap();
    let events = rig.collect_until(WAIT, |e| matches!(e.kind, EventKind::Timeout { .. }));
    let fired = sent.elapsed();

    assert_eq!(timeouts_named(&events, "t1"), 1);
    assert!(fired >= Duration::from_millis(100), "fired after {:?}", fired);
    assert!(fired < Duration::from_millis(600), "fired after {:?}", fired);

    // The timer moves the press task on
    rig.until_enter(C1, B);
    rig.shutdown().unwrap();
}

#[test]
fn test_updates_from_two_sources_keep_receipt_order() {
    let mut rig = Rig::launch(&["left", "right"]).unwrap();
    let bindings = vec![
        press_bindings("left").remove(0),
        press_bindings("right").remove(1),
    ];
    rig.send(&[
        add_task(C1, "press", bindings, Metadata::new(), &["memory"]),
        Event::new(C1, EventKind::Start),
    ])
    .unwrap();
    rig.until_enter(C1, A);
    assert!(rig.wait_registered("left", 1, WAIT));
    assert!(rig.wait_registered("right", 1, WAIT));

    rig.set_input("left", C1, "lever", true).unwrap();
    thread::sleep(Duration::from_millis(3));
    rig.set_input("right", C1, "light", Value::Int(3)).unwrap();

    let events = rig.collect_for(Duration::from_millis(300));
    let changed: Vec<ComponentId> = events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::ComponentChanged { component, .. } => Some(component.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(
        changed,
        vec![
            ComponentId::for_slot(C1, "lever", 0),
            ComponentId::for_slot(C1, "light", 0)
        ]
    );

    let logs = rig.logs.clone();
    rig.shutdown().unwrap();

    // Logged values are the task's cached values when the change was handled
    let values: Vec<Value> = logs
        .logger(C1)
        .events()
        .into_iter()
        .filter(|e| e.event_type == "ComponentChanged")
        .filter_map(|e| e.value)
        .collect();
    assert_eq!(values, vec![Value::Bool(true), Value::Int(3)]);
    assert!(logs.logger(C1).is_closed());
}

#[test]
fn test_fatal_source_is_dropped_others_keep_running() {
    let mut rig = Rig::launch(&["flaky", "steady"]).unwrap();
    started_press(&mut rig, "flaky", Metadata::new());
    rig.add_task(C2, "ticker", ticker_bindings("steady"), Metadata::new())
        .unwrap();
    rig.control(C2, EventKind::Start).unwrap();
    assert!(rig.wait_registered("steady", 1, WAIT));

    // The lever press makes the task write its light, which fails fatally
    rig.hardware("flaky").fail_fatal("cable pulled");
    rig.set_input("flaky", C1, "lever", true).unwrap();

    let events = rig.collect_for(Duration::from_millis(600));
    let fatal = errors_of(&events, ErrorKind::SourceFatal);
    assert_eq!(fatal.len(), 1, "{:?}", fatal);
    match &fatal[0].kind {
        EventKind::Error { source, detail, .. } => {
            assert_eq!(source.as_ref(), Some(&SourceId::new("flaky")));
            assert!(detail.contains("cable pulled"));
        }
        other => panic!("unexpected {:?}", other),
    }

    let fatal_at = events.iter().position(|e| e == &fatal[0]).unwrap();
    let ticks_after = events[fatal_at..]
        .iter()
        .filter(|e| e.chamber == Some(C2) && matches!(e.kind, EventKind::StateEnter { .. }))
        .count();
    assert!(ticks_after >= 2, "ticker entered {} states", ticks_after);

    assert!(rig.hardware("flaky").wait_closed(WAIT));
    rig.shutdown().unwrap();
}

#[test]
fn test_rejected_registration_blocks_start() {
    let mut rig = Rig::launch(&["box"]).unwrap();
    let light = ComponentId::for_slot(C1, "light", 0);
    rig.hardware("box").reject_registration(&light, "line in use");

    rig.add_task(C1, "press", press_bindings("box"), Metadata::new())
        .unwrap();
    let events = rig.collect_until(WAIT, |e| matches!(e.kind, EventKind::Error { .. }));
    let rejected = errors_of(&events, ErrorKind::ComponentRegister);
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].chamber, Some(C1));
    assert!(matches!(
        &rejected[0].kind,
        EventKind::Error { source: Some(source), .. } if source == &SourceId::new("box")
    ));
    assert!(errors_of(&events, ErrorKind::SourceNonFatal).is_empty());

    // Start is refused for the blocked chamber
    rig.control(C1, EventKind::Start).unwrap();
    let events = rig.collect_for(Duration::from_millis(300));
    assert_eq!(errors_of(&events, ErrorKind::ComponentRegister).len(), 1);
    assert!(!types(&events).contains(&EventType::Start));
    assert!(!types(&events).contains(&EventType::StateEnter));

    // Another chamber on the same source still runs
    rig.add_task(C2, "press", press_bindings("box"), Metadata::new())
        .unwrap();
    rig.control(C2, EventKind::Start).unwrap();
    let events = rig.until_enter(C2, A);
    assert_eq!(events.last().and_then(|e| e.chamber), Some(C2));

    // Re-adding the task once the line is free unblocks the chamber
    rig.hardware("box").heal_component(&light);
    rig.add_task(C1, "press", press_bindings("box"), Metadata::new())
        .unwrap();
    rig.control(C1, EventKind::Start).unwrap();
    let events = rig.until_enter(C1, A);
    assert_eq!(
        events.last().map(|e| (e.chamber, e.kind.clone())),
        Some((Some(C1), EventKind::StateEnter { state: A }))
    );
    rig.shutdown().unwrap();
}

#[test]
fn test_write_to_lost_source_halts_chamber() {
    let mut rig = Rig::launch(&["box"]).unwrap();
    started_press(&mut rig, "box", Metadata::new());

    rig.hardware("box").crash("usb reset").unwrap();
    let events = rig.collect_until(WAIT, |e| matches!(e.kind, EventKind::Error { .. }));
    assert_eq!(errors_of(&events, ErrorKind::SourceFatal).len(), 1);

    let light = ComponentId::for_slot(C1, "light", 0);
    rig.send(&[Event::new(
        C1,
        EventKind::ComponentWrite {
            component: light,
            value: Value::Bool(true),
        },
    )])
    .unwrap();

    let events = rig.collect_until(WAIT, |e| matches!(e.kind, EventKind::StateExit { .. }));
    let unavailable = errors_of(&events, ErrorKind::SourceUnavailable);
    assert_eq!(unavailable.len(), 1);
    assert_eq!(unavailable[0].chamber, Some(C1));
    assert_eq!(
        events.last().map(|e| e.kind.clone()),
        Some(EventKind::StateExit { state: A })
    );
    rig.shutdown().unwrap();
}

#[test]
fn test_extend_adds_to_remaining() {
    let manager = TimeoutManager::spawn(TimeoutConfig::default()).unwrap();
    let timers = manager.handle();
    let key = TimeoutKey::new(C1, "t1");
    timers
        .add(Timeout::new(key.clone(), Duration::from_secs(2), |_, _| {}))
        .unwrap();

    thread::sleep(Duration::from_secs(1));
    timers.extend(key.clone(), Duration::from_secs(2)).unwrap();

    let remaining = timers.remaining(key).unwrap();
    assert!(remaining <= Duration::from_secs(3), "{:?}", remaining);
    assert!(remaining > Duration::from_millis(2900), "{:?}", remaining);
    manager.shutdown();
}

#[test]
fn test_pause_freezes_timers() {
    let mut rig = Rig::launch(&["box"]).unwrap();
    rig.add_task(C1, "press", press_bindings("box"), hold(150))
        .unwrap();

    let sent = Instant::now();
    rig.control(C1, EventKind::Start).unwrap();
    rig.until_enter(C1, A);
    thread::sleep(Duration::from_millis(50));

    rig.control(C1, EventKind::Pause).unwrap();
    let paused = rig.collect_for(Duration::from_millis(200));
    assert_eq!(timeouts_named(&paused, "t1"), 0);

    rig.control(C1, EventKind::Resume).unwrap();
    let events = rig.collect_until(WAIT, |e| matches!(e.kind, EventKind::Timeout { .. }));
    let fired = sent.elapsed();

    assert_eq!(timeouts_named(&events, "t1"), 1);
    assert!(fired >= Duration::from_millis(330), "fired after {:?}", fired);
    rig.shutdown().unwrap();
}

#[test]
fn test_state_exit_always_paired() {
    let mut rig = Rig::launch(&["box"]).unwrap();
    let mut constants = hold(5000);
    constants.insert("trials".into(), Value::Int(2));
    rig.send(&[
        add_task(C1, "press", press_bindings("box"), constants, &["memory"]),
        Event::new(C1, EventKind::Start),
    ])
    .unwrap();
    let mut events = rig.until_enter(C1, A);
    assert!(rig.wait_registered("box", 2, WAIT));

    rig.set_input("box", C1, "lever", true).unwrap();
    events.extend(rig.until_enter(C1, B));
    rig.set_input("box", C1, "lever", false).unwrap();
    events.extend(rig.until_enter(C1, A));
    rig.set_input("box", C1, "lever", true).unwrap();
    events.extend(rig.collect_until(WAIT, |e| e.kind == EventKind::TaskComplete));
    events.extend(rig.collect_for(Duration::from_millis(100)));

    let states: Vec<Event> = events.into_iter().filter(is_state_event).collect();
    for (i, event) in states.iter().enumerate() {
        if let EventKind::StateExit { .. } = event.kind {
            let next = states.get(i + 1).map(|e| e.event_type());
            assert!(
                matches!(next, Some(EventType::StateEnter | EventType::TaskComplete)),
                "StateExit at {} followed by {:?}",
                i,
                next
            );
        }
    }
    let completions = states
        .iter()
        .filter(|e| e.kind == EventKind::TaskComplete)
        .count();
    assert_eq!(completions, 1);
    assert_eq!(states.last().map(|e| e.kind.clone()), Some(EventKind::TaskComplete));

    let logs = rig.logs.clone();
    rig.shutdown().unwrap();
    assert_eq!(logs.logger(C1).stops(), 1);
}

#[test]
fn test_changed_only_when_value_differs() {
    let mut rig = Rig::launch(&["box"]).unwrap();
    started_press(&mut rig, "box", Metadata::new());

    rig.set_input("box", C1, "lever", true).unwrap();
    rig.set_input("box", C1, "lever", true).unwrap();
    rig.set_input("box", C1, "lever", false).unwrap();
    let events = rig.collect_for(Duration::from_millis(300));

    let changed = types(&events)
        .into_iter()
        .filter(|t| *t == EventType::ComponentChanged)
        .count();
    assert_eq!(changed, 2);
    assert!(!types(&events).contains(&EventType::ComponentUpdate));
    rig.shutdown().unwrap();
}

#[test]
fn test_panic_in_one_chamber_spares_another() {
    let mut rig = Rig::launch(&["box"]).unwrap();
    rig.add_task(C1, "faulty", faulty_bindings("box"), Metadata::new())
        .unwrap();
    rig.add_task(C2, "ticker", ticker_bindings("box"), Metadata::new())
        .unwrap();
    rig.send(&[Event::new(C1, EventKind::Start), Event::new(C2, EventKind::Start)])
        .unwrap();
    assert!(rig.wait_registered("box", 2, WAIT));

    rig.set_input("box", C1, "lever", true).unwrap();
    let events = rig.collect_for(Duration::from_millis(500));

    let unhandled = errors_of(&events, ErrorKind::Unhandled);
    assert_eq!(unhandled.len(), 1);
    assert_eq!(unhandled[0].chamber, Some(C1));
    match &unhandled[0].kind {
        EventKind::Error { detail, .. } => assert!(detail.contains("exploded")),
        other => panic!("unexpected {:?}", other),
    }

    let faulty = of_chamber(&events, C1);
    assert!(faulty.contains(&Event::new(C1, EventKind::StateExit { state: ARMED })));

    let panic_at = events.iter().position(|e| e == &unhandled[0]).unwrap();
    let ticks_after = events[panic_at..]
        .iter()
        .filter(|e| e.chamber == Some(C2) && matches!(e.kind, EventKind::StateEnter { .. }))
        .count();
    assert!(ticks_after >= 2, "ticker entered {} states", ticks_after);

    let stats = rig.shutdown().unwrap();
    assert_eq!(stats.panics_contained, 1);
}

#[test]
fn test_protocol_files_reach_the_task() {
    let mut rig = Rig::launch(&["ni"]).unwrap();
    let bindings = parse_address_map(
        r#"{
            "lever": { "type": "digital_input", "source": "ni", "address": "port0/line0" },
            "light": { "type": "digital_output", "source": "ni", "address": "port1/line0" }
        }"#,
    )
    .unwrap();
    let constants = parse_protocol(r#"{ "constants": { "hold_ms": 750, "trials": 3 } }"#).unwrap();

    rig.add_task(C1, "press", bindings.clone(), constants).unwrap();
    let events = rig.collect_until(WAIT, |e| e.kind == EventKind::Init);
    let init = events.last().unwrap();
    assert_eq!(init.metadata.get("hold_ms"), Some(&Value::Int(750)));
    assert_eq!(init.metadata.get("trials"), Some(&Value::Int(3)));

    // A constant the task does not declare is a protocol error
    let bad = parse_protocol(r#"{ "constants": { "holdms": 750 } }"#).unwrap();
    rig.add_task(C2, "press", bindings, bad).unwrap();
    let events = rig.collect_until(WAIT, |e| matches!(e.kind, EventKind::Error { .. }));
    let malformed = errors_of(&events, ErrorKind::MalformedProtocol);
    assert_eq!(malformed.len(), 1);
    assert_eq!(malformed[0].chamber, Some(C2));
    rig.shutdown().unwrap();
}

#[test]
fn test_wrong_component_type_rejected() {
    let mut rig = Rig::launch(&["box"]).unwrap();
    let mut bindings = press_bindings("box");
    bindings[1].kind = operant_core::ComponentKind::ANALOG_INPUT;

    rig.add_task(C1, "press", bindings, Metadata::new()).unwrap();
    let events = rig.collect_until(WAIT, |e| matches!(e.kind, EventKind::Error { .. }));
    assert_eq!(errors_of(&events, ErrorKind::InvalidComponentType).len(), 1);
    assert!(!types(&events).contains(&EventType::Init));
    rig.shutdown().unwrap();
}

#[test]
fn test_sources_added_and_removed_at_run_time() {
    let mut rig = Rig::launch(&[]).unwrap();
    rig.send(&[Event::global(EventKind::AddSource {
        source: SourceId::new("extra"),
        source_type: "virtual".into(),
    })])
    .unwrap();
    rig.collect_until(WAIT, |e| e.event_type() == EventType::AddSource);

    rig.add_task(C1, "ticker", ticker_bindings("extra"), Metadata::new())
        .unwrap();
    let events = rig.collect_until(WAIT, |e| e.kind == EventKind::Init);
    assert_eq!(events.last().map(Event::event_type), Some(EventType::Init));

    // The added source's device side is reachable
    let extra = rig.devices.get(&SourceId::new("extra")).unwrap();
    let light = ComponentId::for_slot(C1, "light", 0);
    rig.send(&[Event::new(
        C1,
        EventKind::ComponentWrite {
            component: light.clone(),
            value: Value::Bool(true),
        },
    )])
    .unwrap();
    assert!(extra.wait_for_writes(1, WAIT));
    assert_eq!(extra.writes(), vec![(light, Value::Bool(true))]);

    rig.send(&[Event::global(EventKind::RemoveSource {
        source: SourceId::new("extra"),
    })])
    .unwrap();
    rig.collect_until(WAIT, |e| e.event_type() == EventType::RemoveSource);

    // Its components are gone with it
    rig.send(&[Event::new(
        C1,
        EventKind::ComponentWrite {
            component: ComponentId::for_slot(C1, "light", 0),
            value: Value::Bool(true),
        },
    )])
    .unwrap();
    let events = rig.collect_until(WAIT, |e| matches!(e.kind, EventKind::Error { .. }));
    assert_eq!(errors_of(&events, ErrorKind::SourceUnavailable).len(), 1);

    // Unknown source types are reported, not fatal
    rig.send(&[Event::global(EventKind::AddSource {
        source: SourceId::new("cam"),
        source_type: "camera".into(),
    })])
    .unwrap();
    let events = rig.collect_until(WAIT, |e| matches!(e.kind, EventKind::Error { .. }));
    assert_eq!(errors_of(&events, ErrorKind::Unhandled).len(), 1);
    rig.shutdown().unwrap();
}

#[test]
fn test_json_lines_logger_from_registry() {
    let path = std::env::temp_dir().join(format!("operant-scenario-{}.jsonl", std::process::id()));
    let _ = std::fs::remove_file(&path);

    let mut rig = Rig::launch(&["box"]).unwrap();
    let event = add_task(C1, "press", press_bindings("box"), hold(5000), &["jsonl"])
        .with_meta("log_path", path.to_string_lossy().into_owned());
    rig.send(&[event, Event::new(C1, EventKind::Start)]).unwrap();
    rig.until_enter(C1, A);
    rig.control(C1, EventKind::Stop).unwrap();
    rig.collect_until(WAIT, |e| matches!(e.kind, EventKind::StateExit { .. }));
    rig.shutdown().unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    let records: Vec<serde_json::Value> = text
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    let kinds: Vec<&str> = records
        .iter()
        .filter_map(|r| r["event_type"].as_str())
        .collect();
    assert_eq!(kinds, vec!["Init", "Start", "StateEnter", "Stop", "StateExit"]);
    assert_eq!(records[2]["state"], "A");
    let _ = std::fs::remove_file(&path);
}

#[test]
fn test_source_behind_a_pipe() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let (near, far) = tokio::io::duplex(64 * 1024);
    let near = bridge(near, runtime.handle());
    let far = bridge(far, runtime.handle());

    let (source, hardware) = VirtualSource::new();
    let remote = SourceProcess::spawn(
        SourceId::new("remote"),
        Box::new(source),
        SourceConfig::default(),
        far.inbound,
        far.outlet,
    )
    .unwrap();

    let config = RuntimeConfig {
        poll_timeout: Duration::from_millis(10),
        ..RuntimeConfig::default()
    };
    let mut rig = Rig::launch_with(config, &[], move |process| {
        process.attach_source(SourceId::new("remote"), near.outlet, near.inbound)
    })
    .unwrap();

    rig.add_task(C1, "press", press_bindings("remote"), Metadata::new())
        .unwrap();
    rig.control(C1, EventKind::Start).unwrap();
    rig.until_enter(C1, A);

    let lever = ComponentId::for_slot(C1, "lever", 0);
    let deadline = Instant::now() + WAIT;
    while hardware.registered().len() < 2 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(2));
    }
    hardware.set_input(&lever, Value::Bool(true)).unwrap();

    assert!(hardware.wait_for_writes(1, WAIT));
    assert_eq!(
        hardware.writes(),
        vec![(ComponentId::for_slot(C1, "light", 0), Value::Bool(true))]
    );
    rig.until_enter(C1, B);

    rig.shutdown().unwrap();
    assert!(hardware.wait_closed(WAIT));
    remote.join();
    runtime.shutdown_timeout(Duration::from_secs(1));
}

proptest! {
    #[test]
    fn test_changed_iff_value_differs(values in proptest::collection::vec(0i64..3, 1..40)) {
        let manager = TimeoutManager::spawn(TimeoutConfig::default()).unwrap();
        let (sink, _rx) = link();
        let setup = TaskSetup {
            chamber: C1,
            task_type: "press".into(),
            bindings: press_bindings("box"),
            constants: Metadata::new(),
            timers: TimerLink::new(manager.handle(), sink),
        };
        let mut machine = Machine::<Press>::new(setup).unwrap();
        let lever = ComponentId::for_slot(C1, "lever", 0);

        let mut last = Value::Null;
        for v in values {
            let value = Value::Int(v);
            let changed = machine.update_component(&lever, value.clone());
            prop_assert_eq!(changed.is_some(), value != last);
            last = value;
        }
    }
}
