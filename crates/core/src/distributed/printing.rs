//! Rank-gated console output.
//!
//! Every line carries a UTC wall-clock timestamp and the rank tag:
//!
//! ```text
//! [2026-03-01T12:00:00.123Z] [rank 0/4] epoch 1 loss 0.25
//! ```
//!
//! Before initialization (or after finalize) the tag is `[rank ?]` and
//! [`print_rank0`] prints on every process.

use std::fmt::Display;

use chrono::{SecondsFormat, Utc};

use super::context::ProcessGroupContext;

fn rank_tag(ctx: &ProcessGroupContext) -> String {
    match ctx.session("print") {
        Ok(session) => format!("[rank {}/{}]", session.rank(), session.world_size()),
        Err(_) => "[rank ?]".to_string(),
    }
}

/// Format one output line for this process.
pub fn format_line(ctx: &ProcessGroupContext, message: impl Display) -> String {
    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    format!("[{timestamp}] {} {message}", rank_tag(ctx))
}

/// The line [`print_rank0`] would print, or `None` on non-zero ranks.
pub fn rank0_line(ctx: &ProcessGroupContext, message: impl Display) -> Option<String> {
    match ctx.rank() {
        Ok(rank) if rank != 0 => None,
        _ => Some(format_line(ctx, message)),
    }
}

/// Print on rank 0 only (on every process while uninitialized).
pub fn print_rank0(ctx: &ProcessGroupContext, message: impl Display) {
    if let Some(line) = rank0_line(ctx, message) {
        println!("{line}");
    }
}

/// Print on every rank.
pub fn print_all(ctx: &ProcessGroupContext, message: impl Display) {
    println!("{}", format_line(ctx, message));
}

/// `println!`-style wrapper around [`print_rank0`].
#[macro_export]
macro_rules! rank0_println {
    ($ctx:expr, $($arg:tt)*) => {
        $crate::distributed::print_rank0($ctx, format_args!($($arg)*))
    };
}

/// `println!`-style wrapper around [`print_all`].
#[macro_export]
macro_rules! all_println {
    ($ctx:expr, $($arg:tt)*) => {
        $crate::distributed::print_all($ctx, format_args!($($arg)*))
    };
}
