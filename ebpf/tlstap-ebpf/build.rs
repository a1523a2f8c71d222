use which::which;

/// Rebuild whenever the `bpf-linker` on $PATH changes, since cargo has no way
/// to declare a dependency on a host binary.
fn main() {
    let bpf_linker = which("bpf-linker").expect("bpf-linker not found on PATH");
    println!("cargo:rerun-if-changed={}", bpf_linker.display());
}
