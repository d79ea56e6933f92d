/*
 * Kindling - Build Agent
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::doc_markdown)]

//! Build agent for kindling runner pods
//!
//! The runner container never holds builder or cluster privileges. It drops
//! request files into a volume shared with this agent, which performs the
//! image build or manifest apply and answers with a completion file.

pub mod caller;
pub mod error;
pub mod helper;
pub mod protocol;
pub mod runner;

pub use caller::{Caller, PollSettings};
pub use error::{Error, Result};
pub use helper::Helper;
pub use protocol::{Completion, Job, JobKind};
pub use runner::{JobRunner, KubectlRunner};
