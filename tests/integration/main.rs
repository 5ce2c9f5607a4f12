//! Integration tests for the crawl scheduler
//!
//! Scheduler tests drive the worker pool with scripted fetchers and the
//! in-memory store. Fetcher tests use wiremock to stand in for the remote.

mod common;
mod fetcher_tests;
mod scheduler_tests;
