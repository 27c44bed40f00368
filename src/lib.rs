//! # Diagram Chat
//!
//! Turns natural-language requests into architecture diagrams and serves
//! them in whatever format the client can still use.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌──────────┐   ┌──────────┐
//! │ classify │──▶│ extractor │──▶│  layout  │──▶│  store   │
//! │  prompt  │   │ LLM/templ │   │  seeded  │   │ .drawio  │
//! └──────────┘   └───────────┘   └──────────┘   └────┬─────┘
//!                                                    │
//!                      ┌─────────────────────────────┤
//!                      ▼                             ▼
//!                ┌──────────┐                  ┌──────────┐
//!                │  render  │◀── HTTP ────────│ fallback │
//!                │ SVG/PNG  │                  │  client  │
//!                └──────────┘                  └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! dchat generate "Draw a diagram of our AWS migration"
//! dchat render generated/<file>.drawio --format png -o diagram.png
//! dchat serve
//! dchat fetch <file>.drawio
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`classify`] | Diagram-request and network-request detection |
//! | [`llm`] | Chat-completion client abstraction |
//! | [`knowledge`] | Knowledge-base retrieval |
//! | [`templates`] | Fallback diagram templates |
//! | [`extractor`] | Prompt → diagram components |
//! | [`document`] | Diagram document model, XML I/O and repair |
//! | [`layout`] | Components → positioned document |
//! | [`store`] | Generated-file storage |
//! | [`pipeline`] | Generation and chat-turn orchestration |
//! | [`render`] | SVG, PNG, screenshot and D2 backends |
//! | [`fallback`] | Download fallback chain client |
//! | [`progress`] | Fallback status reporting |
//! | [`server`] | HTTP server |

pub mod classify;
pub mod config;
pub mod document;
pub mod extractor;
pub mod fallback;
pub mod knowledge;
pub mod layout;
pub mod llm;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod render;
pub mod server;
pub mod store;
pub mod templates;
