pub mod compile;
pub mod parse;

use aql_compiler::CompileError;

/// Exit status for a failed run: 2 for server-side compiler errors, 1 for
/// everything else.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<CompileError>() {
        Some(e) if e.is_server_error() => 2,
        _ => 1,
    }
}
