//! Core library for cantina; git plumbing, worktree lifecycle, runtime
//! identity, and configuration for the parallel agent-execution engine.
//!
//! This crate provides:
//! - Runtime home resolution and per-project dispatch log layout
//! - A `GitRunner` seam over the `git` CLI with per-operation deadlines
//! - Worktree creation, listing, merging, and cleanup for parallel batches
//! - Read-time log sanitation (ANSI stripping, JSONL unwrapping, tails)
//! - Configuration loaded from `~/.cantina/config.toml`

pub mod config;
pub mod git;
pub mod logs;
pub mod runtime;
pub mod worktree;
pub mod worktree_manager;
