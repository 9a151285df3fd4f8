// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Shared configuration, retry policy and status types for the slot analysis workers.

pub mod config;
pub mod retry;
pub mod status;
