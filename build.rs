fn main() {
    if !(cfg!(target_os = "linux") && cfg!(target_arch = "x86_64")) {
        panic!(
            "{} only works on linux x86_64: the trap encoding and ptrace \
             stop semantics here are that platform's",
            env!("CARGO_PKG_NAME")
        );
    }
}
