use std::process::Command;

/// Run git and return its trimmed stdout, if git is available and succeeds
fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    Some(text.trim().to_string()).filter(|s| !s.is_empty())
}

fn main() {
    // Source tarballs have no git metadata
    let commit = git(&["rev-parse", "--short", "HEAD"]).unwrap_or_else(|| "unknown".to_string());
    let build_date = chrono::Utc::now().format("%Y-%m-%d");

    println!("cargo:rustc-env=SNIMUX_COMMIT={}", commit);
    println!("cargo:rustc-env=SNIMUX_BUILD_DATE={}", build_date);
    println!("cargo:rerun-if-changed=.git/HEAD");
}
