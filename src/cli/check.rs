use std::process::Command;

use enclave_bench::launcher::{FeatureFlags, Wrapper};

// EXTERNAL TOOLS THE SWEEPS AND THE IMAGE RUNNER SHELL OUT TO
const REQUIRED: [&str; 5] = ["nix-build", "sudo", "mount", "ssh", "sgx-lkl-run"];
const PROFILING: [&str; 3] = ["perf", "stackcollapse-perf.pl", "flamegraph.pl"];

fn check_tool(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn report(tools: &[&str]) -> bool {
    let mut ok = true;
    for tool in tools {
        if check_tool(tool) {
            println!("  {:<24}OK", tool);
        } else {
            println!("  {:<24}MISSING", tool);
            ok = false;
        }
    }
    ok
}

// TRUE WHEN EVERYTHING NEEDED FOR THE CURRENT FLAGS IS PRESENT
pub fn run_check() -> bool {
    println!("ENCLAVE-BENCH DEPENDENCY CHECK");
    println!();

    let mut ok = report(&REQUIRED);
    println!();

    let flags = FeatureFlags::from_env(&FeatureFlags::process_env());
    println!("PROFILING TOOLS:");
    if !report(&PROFILING) {
        ok = false;
    }
    println!();

    println!("FEATURE FLAGS:");
    println!("  {:<24}{}", "wrapper", flags.wrapper().label());
    if flags.wrapper() == Wrapper::Debugger && !check_tool("sgx-lkl-gdb") {
        println!("  {:<24}MISSING", "sgx-lkl-gdb");
        ok = false;
    }
    if flags.wrapper() == Wrapper::Tracer && !check_tool("strace") {
        println!("  {:<24}MISSING", "strace");
        ok = false;
    }
    println!();

    if ok {
        println!("ALL CHECKS PASSED");
    } else {
        println!("SOME CHECKS FAILED");
        if !check_tool("nix-build") {
            println!("  Install Nix: https://nixos.org/download");
        }
        if !check_tool("flamegraph.pl") {
            println!("  FlameGraph scripts: https://github.com/brendangregg/FlameGraph");
        }
    }
    ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonsense_tool_is_missing() {
        assert!(!check_tool("enclave-bench-no-such-tool"));
    }
}
