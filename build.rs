use std::env;
use std::process::Command;

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn git_output(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if text.is_empty() {
        return None;
    }
    Some(text)
}

fn compute_default_version() -> String {
    let pkg_version = env::var("CARGO_PKG_VERSION").unwrap_or_else(|_| "0.0.0".to_string());
    match git_output(&["rev-parse", "--short=12", "HEAD"]) {
        Some(sha) => format!("{pkg_version}+{sha}"),
        None => format!("{pkg_version}+dev"),
    }
}

fn main() {
    let version = non_empty_env("GSYNC_VERSION_STRING").unwrap_or_else(compute_default_version);
    println!("cargo:rustc-env=GSYNC_VERSION_STRING={version}");

    println!("cargo:rerun-if-env-changed=GSYNC_VERSION_STRING");
    match git_output(&["rev-parse", "--git-path", "HEAD"]) {
        Some(path) => println!("cargo:rerun-if-changed={path}"),
        None => println!("cargo:rerun-if-changed=.git/HEAD"),
    }
}
