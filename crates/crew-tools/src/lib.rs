// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod describe;
pub mod hooks;
pub mod permissions;
pub mod tool;
pub mod toolset;

pub use describe::{inject_description_parameter, DescribedToolSet, DESCRIPTION_PARAMETER};
pub use hooks::{HookCommand, HookMatcher, HookOutcome, HookRunner, HooksConfig};
pub use permissions::{Decision, PermissionsChecker};
pub use tool::{FnHandler, ToolCall, ToolCallResult, ToolDef, ToolHandler};
pub use toolset::{
    ElicitationAction, ElicitationHandler, ElicitationRequest, ElicitationResponse,
    OAuthSuccessHandler, StaticToolSet, ToolSet, ToolSetError,
};
