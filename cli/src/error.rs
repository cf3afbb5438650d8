use std::process::ExitCode;

use conduit::ActionResult;

pub type CliResult<T> = anyhow::Result<T>;

/// Convert a CliResult to an ExitCode, printing errors to stderr
pub fn to_exit_code(result: CliResult<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            for cause in e.chain().skip(1) {
                eprintln!("  caused by: {cause}");
            }
            ExitCode::FAILURE
        }
    }
}

/// Fail when the bridge answered with `code = -1`
pub fn ensure_success(result: &ActionResult) -> CliResult<()> {
    if result.is_success() {
        return Ok(());
    }
    match result.data.as_str() {
        Some(message) => anyhow::bail!("{} failed: {message}", result.method),
        None => anyhow::bail!("{} failed: {}", result.method, result.data),
    }
}
