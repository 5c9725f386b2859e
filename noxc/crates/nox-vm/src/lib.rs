//! The bytecode interpreter: dispatch loop, call protocol, built-in
//! natives, and the disassembler used for tracing.

pub mod disassembler;
pub mod natives;
mod vm;

pub use disassembler::{disassemble_chunk, disassemble_instruction};
pub use natives::install as install_natives;
pub use vm::{run, InterpretResult};

#[cfg(test)]
mod tests {
    use super::*;
    use nox_gc::Runtime;

    fn run_source(source: &str) -> (InterpretResult, Runtime) {
        let mut runtime = Runtime::new();
        install_natives(&mut runtime);
        match nox_compiler::compile(source, &mut runtime) {
            Ok(function) => {
                let result = run(&mut runtime, function, false);
                (result, runtime)
            }
            Err(_) => (InterpretResult::CompileError, runtime),
        }
    }

    #[test]
    fn arithmetic_and_print() {
        let (result, _) = run_source("print 1 + 2 * 3;");
        assert_eq!(result, InterpretResult::Ok);
    }

    #[test]
    fn string_concatenation_interns_result() {
        let (result, mut runtime) = run_source(
            r#"
            var a = "foo" + "bar";
            var b = "foo" + "bar";
            print a == b;
            "#,
        );
        assert_eq!(result, InterpretResult::Ok);
        let _ = &mut runtime;
    }

    #[test]
    fn closures_share_captured_upvalue() {
        let (result, _) = run_source(
            r#"
            fun makeCounter() {
                var count = 0;
                fun inc() {
                    count = count + 1;
                    return count;
                }
                return inc;
            }
            var counter = makeCounter();
            print counter();
            print counter();
            "#,
        );
        assert_eq!(result, InterpretResult::Ok);
    }

    #[test]
    fn classes_methods_and_inheritance() {
        let (result, _) = run_source(
            r#"
            class Animal {
                speak() {
                    return "...";
                }
            }
            class Dog < Animal {
                init(name) {
                    this.name = name;
                }
                speak() {
                    return this.name + " says woof";
                }
                parentSpeak() {
                    return super.speak();
                }
            }
            var d = Dog("Rex");
            print d.speak();
            print d.parentSpeak();
            "#,
        );
        assert_eq!(result, InterpretResult::Ok);
    }

    #[test]
    fn lists_build_index_and_store() {
        let (result, _) = run_source(
            r#"
            var xs = [1, 2, 3];
            xs[1] = 20;
            print xs[1];
            append(xs, 4);
            print xs[3];
            delete(xs, 0);
            print xs[0];
            "#,
        );
        assert_eq!(result, InterpretResult::Ok);
    }

    #[test]
    fn undefined_variable_is_runtime_error() {
        let (result, _) = run_source("print nope;");
        assert_eq!(result, InterpretResult::RuntimeError);
    }

    #[test]
    fn wrong_arity_is_runtime_error() {
        let (result, _) = run_source(
            r#"
            fun f(a, b) { return a + b; }
            f(1);
            "#,
        );
        assert_eq!(result, InterpretResult::RuntimeError);
    }

    #[test]
    fn out_of_range_list_index_is_runtime_error() {
        let (result, _) = run_source(
            r#"
            var xs = [1, 2];
            print xs[5];
            "#,
        );
        assert_eq!(result, InterpretResult::RuntimeError);
    }

    #[test]
    fn syntax_error_is_compile_error() {
        let (result, _) = run_source("var = ;");
        assert_eq!(result, InterpretResult::CompileError);
    }
}
