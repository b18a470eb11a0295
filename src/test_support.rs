//! Helpers shared by unit tests.

#[cfg(unix)]
use std::path::Path;

/// Write an executable shell script standing in for the runtime CLI.
#[cfg(unix)]
pub fn fake_runtime(dir: &Path, body: &str) -> String {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-runtime");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.display().to_string()
}

/// Fake runtime whose `image inspect` always succeeds and whose `run`
/// doubles `input.value` from the request on stdin.
#[cfg(unix)]
pub const DOUBLING_RUNTIME: &str = r#"if [ "$1" = "image" ]; then echo '[{}]'; exit 0; fi
n=$(sed -E 's/.*"value":(-?[0-9]+).*/\1/')
echo "doubling $n" >&2
printf '{"ok":true,"output":{"doubled":%d}}' $((n * 2))"#;
