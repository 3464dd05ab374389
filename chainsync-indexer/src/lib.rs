//! Keeps a local copy of a remote node's canonical chain.
//!
//! The [`Synchronizer`](synchronizer::Synchronizer) is the entry point: it drives a
//! [`BlockRetriever`](synchronizer::retriever::BlockRetriever) loop that fetches candidate blocks
//! and a [`ReconciliationListener`](synchronizer::listener::ReconciliationListener) that decides
//! whether a candidate extends or replaces the local tip.
pub mod cli;
pub mod config;
pub mod synchronizer;
