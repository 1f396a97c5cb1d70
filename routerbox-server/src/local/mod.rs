// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Local inference
//!
//! Models served by child inference servers (llama.cpp `llama-server` or
//! anything speaking the same OpenAI-compatible HTTP API). At most one server
//! runs per model name; it is spawned on first use and reused afterwards.

mod discovery;
mod supervisor;

pub use discovery::{discover, find, LocalModel, ARTIFACT_EXTENSION};
pub use supervisor::{
    LaunchSpec, LocalEndpoint, LocalSupervisor, ProcessLauncher, ServerHandle, ServerLauncher,
    ServerState, SupervisorError,
};
