//! End-to-end scenarios from `SPEC_FULL.md` §8: compile-and-run a whole
//! program through `Vm::interpret` and assert on captured `print` output
//! (the six success scenarios) or on the resulting `VitteError` (the three
//! runtime-error scenarios).

use pretty_assertions::assert_eq;

use vitte_core::{BufferHost, Vm, VitteError, VmOptions};

fn run(source: &str) -> BufferHost {
    let mut vm = Vm::new(VmOptions::new());
    vm.set_host(Box::new(BufferHost::default()));
    let outcome = vm.interpret(source);
    assert!(outcome.is_ok(), "expected {source:?} to succeed, got {outcome:?}");
    let host = vm.host().as_any().downcast_ref::<BufferHost>().expect("buffer host installed");
    BufferHost { lines: host.lines.clone(), errors: host.errors.clone() }
}

fn run_err(source: &str) -> VitteError {
    let mut vm = Vm::new(VmOptions::new());
    vm.set_host(Box::new(BufferHost::default()));
    match vm.interpret(source) {
        Err(err) => err,
        Ok(_) => panic!("expected {source:?} to fail"),
    }
}

#[test]
fn arithmetic_precedence() {
    let host = run("print 1 + 2 * 3;");
    assert_eq!(host.lines, vec!["7"]);
}

#[test]
fn string_concatenation() {
    let host = run(r#"var a = "he"; var b = "llo"; print a + b;"#);
    assert_eq!(host.lines, vec!["hello"]);
}

#[test]
fn for_loop_accumulation() {
    let host = run("var x = 0; for (var i = 0; i < 5; i = i + 1) x = x + i; print x;");
    assert_eq!(host.lines, vec!["10"]);
}

#[test]
fn closure_over_mutable_upvalue() {
    let host = run(indoc::indoc! {"
        fun make(n) {
            fun inc() {
                n = n + 1;
                return n;
            }
            return inc;
        }
        var c = make(41);
        c();
        print c();
    "});
    assert_eq!(host.lines, vec!["43"]);
}

#[test]
fn inherited_method_dispatch() {
    let host = run(indoc::indoc! {r#"
        class A {
            greet() {
                print "hi";
            }
        }
        class B < A {}
        B().greet();
    "#});
    assert_eq!(host.lines, vec!["hi"]);
}

#[test]
fn initializer_sets_instance_field() {
    let host = run(indoc::indoc! {"
        class C {
            init(v) {
                this.v = v;
            }
        }
        print C(7).v;
    "});
    assert_eq!(host.lines, vec!["7"]);
}

#[test]
fn subtracting_a_number_from_a_string_is_a_runtime_error() {
    let err = run_err(r#"print "a" - 1;"#);
    assert!(matches!(err, VitteError::Runtime(_)));
}

#[test]
fn reading_an_undefined_global_is_a_runtime_error() {
    let err = run_err("print undefined_var;");
    assert!(matches!(err, VitteError::Runtime(_)));
}

#[test]
fn unbounded_recursion_overflows_the_call_stack() {
    let err = run_err("fun f() { f(); } f();");
    match err {
        VitteError::Runtime(err) => assert!(err.message.contains("Stack overflow")),
        other => panic!("expected a runtime error, got {other:?}"),
    }
}

/// `--stress-gc` (`SPEC_FULL.md` §4.6) collects before every single
/// allocation instead of only once the heap crosses its threshold. A
/// program that defines globals, concatenates strings, and builds a
/// closure over a mutable upvalue exercises every allocation path
/// (`intern`, `alloc_function`/`alloc_closure`, `alloc_upvalue`,
/// `define_native` at `Vm::new` time) while nothing it still needs is
/// rooted anywhere except the value stack and `compiler_roots` — this
/// must run to completion without the VM panicking on a freed handle.
#[test]
fn stress_gc_collects_without_freeing_live_data() {
    let mut vm = Vm::new(VmOptions::new().stress_gc(true));
    vm.set_host(Box::new(BufferHost::default()));
    let outcome = vm.interpret(indoc::indoc! {r#"
        var a = "he";
        var b = "llo";
        var greeting = a + b;

        fun make(n) {
            fun inc() {
                n = n + 1;
                return n;
            }
            return inc;
        }
        var counter = make(0);
        counter();
        counter();

        print greeting;
        print counter();
    "#});
    assert!(outcome.is_ok(), "stress-gc run should succeed, got {outcome:?}");
    let host = vm.host().as_any().downcast_ref::<BufferHost>().expect("buffer host installed");
    assert_eq!(host.lines, vec!["hello", "2"]);
}
