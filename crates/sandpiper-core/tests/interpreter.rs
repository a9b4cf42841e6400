//! End-to-end behaviour of the restricted-language interpreter.

use std::sync::Arc;
use std::time::Duration;

use sandpiper_core::lang::{
    compile, run, ExternalCall, Fault, InterruptFlag, Limits, Object, ResourceKind, RunOutcome,
    Suspended,
};

fn eval(source: &str) -> (Object, String) {
    let program = Arc::new(compile(source, &[]).unwrap());
    match run(program, &Limits::default(), &InterruptFlag::new()) {
        RunOutcome::Completed { value, stdout } => (value, stdout),
        other => panic!("expected completion, got {other:?}"),
    }
}

fn fault_of(source: &str, limits: &Limits) -> Fault {
    let program = Arc::new(compile(source, &[]).unwrap());
    match run(program, limits, &InterruptFlag::new()) {
        RunOutcome::Faulted { fault, .. } => fault,
        other => panic!("expected fault, got {other:?}"),
    }
}

fn dict(pairs: Vec<(&str, Object)>) -> Object {
    Object::Dict(pairs.into_iter().map(|(k, v)| (Object::str(k), v)).collect())
}

#[test]
fn test_final_expression_is_the_result() {
    assert_eq!(eval("x = 2\ny = 3\nx * y").0, Object::Int(6));
    assert_eq!(eval("x = 2").0, Object::None);
}

#[test]
fn test_functions_loops_and_comprehensions() {
    let source = r#"
def mean(values):
    total = 0
    for v in values:
        total += v
    return total / len(values)

ages = [22, 38, 26, 35]
adults = [a for a in ages if a >= 25]
{"mean": mean(ages), "adults": len(adults), "squares": {a: a * a for a in ages[:2]}}
"#;
    let (value, _) = eval(source);
    assert_eq!(value.get("mean"), Some(&Object::Float(30.25)));
    assert_eq!(value.get("adults"), Some(&Object::Int(3)));
    assert_eq!(
        value.get("squares"),
        Some(&Object::Dict(vec![
            (Object::Int(22), Object::Int(484)),
            (Object::Int(38), Object::Int(1444)),
        ]))
    );
}

#[test]
fn test_sorting_with_key_and_print_capture() {
    let source = r#"
rows = [{"name": "b", "n": 2}, {"name": "a", "n": 5}, {"name": "c", "n": 1}]
top = sorted(rows, key=lambda r: r["n"], reverse=True)
for r in top[:2]:
    print(r["name"], r["n"])
[r["name"] for r in top]
"#;
    let (value, stdout) = eval(source);
    assert_eq!(stdout, "a 5\nb 2\n");
    assert_eq!(
        value,
        Object::List(vec![Object::str("a"), Object::str("b"), Object::str("c")])
    );
}

#[test]
fn test_closures_capture_by_value() {
    let source = r#"
def make():
    fns = []
    for i in range(3):
        fns.append(lambda: i)
    return [f() for f in fns]
make()
"#;
    assert_eq!(
        eval(source).0,
        Object::List(vec![Object::Int(0), Object::Int(1), Object::Int(2)])
    );
}

#[test]
fn test_external_call_pauses_and_resumes_with_injected_value() {
    let program = Arc::new(
        compile(
            "rows = fetch('titanic', columns=['age'], limit=2)\nrows",
            &["fetch"],
        )
        .unwrap(),
    );
    let limits = Limits::default();
    let flag = InterruptFlag::new();

    let RunOutcome::Paused { call, state } = run(program, &limits, &flag) else {
        panic!("expected pause");
    };
    assert_eq!(
        call,
        ExternalCall {
            name: "fetch".into(),
            args: vec![Object::str("titanic")],
            kwargs: vec![
                ("columns".into(), Object::List(vec![Object::str("age")])),
                ("limit".into(), Object::Int(2)),
            ],
        }
    );
    assert_eq!(state.call(), &call);

    let injected = Object::List(vec![
        dict(vec![("age", Object::Int(22))]),
        dict(vec![("age", Object::None)]),
    ]);
    match state.resume(injected.clone(), &limits, &flag) {
        RunOutcome::Completed { value, .. } => assert_eq!(value, injected),
        other => panic!("expected completion, got {other:?}"),
    }
}

#[test]
fn test_suspended_state_survives_serialization() {
    let source = "print('before')\nn = count('pokemon')\nprint('after')\nn + 1";
    let program = Arc::new(compile(source, &["count"]).unwrap());
    let limits = Limits::default();
    let flag = InterruptFlag::new();

    let RunOutcome::Paused { state, .. } = run(program, &limits, &flag) else {
        panic!("expected pause");
    };
    assert_eq!(state.stdout(), "before\n");

    let bytes = state.to_bytes().unwrap();
    let restored = Suspended::from_bytes(&bytes).unwrap();
    assert_eq!(restored.call().name, "count");

    match restored.resume(Object::Int(41), &limits, &flag) {
        RunOutcome::Completed { value, stdout } => {
            assert_eq!(value, Object::Int(42));
            assert_eq!(stdout, "before\nafter\n");
        }
        other => panic!("expected completion, got {other:?}"),
    }
}

#[test]
fn test_forbidden_constructs_fail_to_compile() {
    for source in [
        "import os",
        "from os import path",
        "class A:\n    pass",
        "try:\n    x = 1\nexcept:\n    pass",
        "with f:\n    pass",
        "def g():\n    yield 1",
        "global x",
    ] {
        assert!(
            matches!(compile(source, &[]), Err(Fault::Compile { .. })),
            "{source:?} should be rejected"
        );
    }
}

#[test]
fn test_runtime_faults_carry_line_numbers() {
    let fault = fault_of("x = 1\ny = x / 0", &Limits::default());
    assert_eq!(
        fault.to_string(),
        "Runtime error: ZeroDivisionError: division by zero (line 2)"
    );
}

#[test]
fn test_resource_limits_are_enforced() {
    let timeout = Limits {
        max_duration: Duration::from_millis(50),
        ..Limits::default()
    };
    assert_eq!(
        fault_of("while True:\n    pass", &timeout),
        Fault::ResourceExceeded(ResourceKind::Timeout)
    );

    let recursion = Limits {
        max_recursion_depth: 20,
        ..Limits::default()
    };
    assert_eq!(
        fault_of("def f(n):\n    return f(n + 1)\nf(0)", &recursion),
        Fault::ResourceExceeded(ResourceKind::Recursion)
    );

    let memory = Limits {
        max_memory_bytes: 1024 * 1024,
        ..Limits::default()
    };
    assert_eq!(
        fault_of("s = 'x' * 4000000", &memory),
        Fault::ResourceExceeded(ResourceKind::Memory)
    );

    let allocations = Limits {
        max_allocations: 10,
        ..Limits::default()
    };
    assert_eq!(
        fault_of("for i in range(100):\n    x = [i]", &allocations),
        Fault::ResourceExceeded(ResourceKind::Allocations)
    );
}

#[test]
fn test_memory_ceiling_counts_live_values_only() {
    let (value, _) = eval("s = ''\nfor i in range(20000):\n    s = s + 'abcdefghij'\nlen(s)");
    assert_eq!(value, Object::Int(200_000));

    let tight = Limits {
        max_memory_bytes: 1024 * 1024,
        ..Limits::default()
    };
    let program = Arc::new(compile("for i in range(50):\n    xs = [0] * 10000\nlen(xs)", &[]).unwrap());
    match run(program, &tight, &InterruptFlag::new()) {
        RunOutcome::Completed { value, .. } => assert_eq!(value, Object::Int(10_000)),
        other => panic!("expected completion, got {other:?}"),
    }

    assert_eq!(
        fault_of(
            "xs = []\nfor i in range(200000):\n    xs.append('abcdefghij')",
            &tight
        ),
        Fault::ResourceExceeded(ResourceKind::Memory)
    );
}

#[test]
fn test_raised_interrupt_cancels_run() {
    let program = Arc::new(compile("while True:\n    pass", &[]).unwrap());
    let flag = InterruptFlag::new();
    flag.raise();
    match run(program, &Limits::default(), &flag) {
        RunOutcome::Faulted { fault, .. } => assert_eq!(fault, Fault::Cancelled),
        other => panic!("expected cancellation, got {other:?}"),
    }
}
