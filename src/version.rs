// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
// Version information for the Pocket LLM Node

/// Full version string with feature description
pub const VERSION: &str = "v0.3.0-prompt-cache-2025-10-17";

/// Semantic version number
pub const VERSION_NUMBER: &str = "0.3.0";

/// Build date
pub const BUILD_DATE: &str = "2025-10-17";

/// Supported features in this version
pub const FEATURES: &[&str] = &[
    "openai-chat-completions",
    "sse-streaming",
    "tool-calls",
    "jinja-chat-templates",
    "persistent-prompt-cache",
    "cache-prewarm",
    "single-model-residency",
];

/// Get formatted version string for logging
pub fn get_version_string() -> String {
    format!("Pocket LLM Node {} ({})", VERSION_NUMBER, BUILD_DATE)
}
