//! Kiln CLI - build container images from Dockerfile-style scripts.

pub mod commands;
pub mod output;
