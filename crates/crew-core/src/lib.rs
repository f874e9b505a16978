// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod bus;
mod events;
mod invoker;
mod prompts;
mod runtime;
mod summarize;
mod team;
mod title;

pub use bus::{EventBus, SUBSCRIBER_BUFFER};
pub use events::RuntimeEvent;
pub use invoker::ApprovalDecision;
pub use prompts::system_prompt;
pub use runtime::{Runtime, RuntimeError};
pub use team::{Agent, Team, DEFAULT_MAX_ITERATIONS, TRANSFER_TASK, TRANSFER_TO_AGENT};
pub use title::{sanitize_title, TitleError, TitleGenerator};
