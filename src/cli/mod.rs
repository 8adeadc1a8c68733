// ENCLAVE-BENCH SUBCOMMANDS
// SWEEP DRIVERS AND TOOLING AROUND THE LIBRARY. ONE FILE PER SUBCOMMAND.

pub mod check;
pub mod fio;
pub mod iperf;
pub mod run_image;

use enclave_bench::launcher::EnvMap;

// RUN-NAME AND EXPORT TIMESTAMP, FIXED FOR THE WHOLE INVOCATION
pub fn now_stamp() -> String {
    chrono::Local::now().format("%Y%m%d-%H%M%S").to_string()
}

pub fn override_map(pairs: &[(String, String)]) -> EnvMap {
    pairs.iter().cloned().collect()
}

pub fn banner(title: &str) {
    println!();
    println!("{}", title);
    println!("{}", "=".repeat(60));
}
