/*
    This file is part of Donet.

    Copyright © 2024 Max Rodriguez <me@maxrdz.com>

    Donet is free software; you can redistribute it and/or modify
    it under the terms of the GNU Affero General Public License,
    as published by the Free Software Foundation, either version 3
    of the License, or (at your option) any later version.

    Donet is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
    GNU Affero General Public License for more details.

    You should have received a copy of the GNU Affero General Public
    License along with Donet. If not, see <https://www.gnu.org/licenses/>.
*/

//! Build-time constants for the `donetd` binary's `--version` output
//! and argument parsing, sourced from the crate manifest and the
//! `GIT_SHA1` environment variable `build.rs` sets via `git_sha1`.

use std::future::Future;

pub const BINARY: &str = "donetd";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const VCS_TAG: &str = env!("GIT_SHA1");
pub const COMPILE_TIME: &str = "unknown";
pub const DEFAULT_TOML: &str = "donet.yml";
pub const GIT_URL: &str = "https://github.com/donet-server/donet/";

#[cfg(debug_assertions)]
pub const BUILD_OPTIONS: &str = "debug";
#[cfg(not(debug_assertions))]
pub const BUILD_OPTIONS: &str = "release";

/// Constrains an `async move {}` block's `Output` type without naming
/// it, since `tokio::runtime::Runtime::block_on` needs it pinned down
/// before type inference can settle on what `?` resolves to inside it.
pub fn set_future_return_type<T, F: Future<Output = T>>(_: &F) {}
