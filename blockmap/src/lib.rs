// SPDX-License-Identifier: GPL-3.0-only

//! Since blockmap is primarily an application and not a library, the semver
//! versioning covers the CLI only. All Rust APIs can change at any time, even
//! in patch releases.
//!
//! The CLI source files use concrete types wherever possible for simplicity,
//! while the "library"-style source files aim to be generic.

pub mod cli;
pub mod copy;
pub mod create;
pub mod extent;
pub mod format;
pub mod source;
pub mod stream;
pub mod util;
