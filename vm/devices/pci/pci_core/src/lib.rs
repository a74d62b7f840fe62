// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Core PCI infrastructure.
//!
//! A collection of constants, types, and register file emulators that are
//! shared by the PCI Express fabric model (bridges, switch ports, and leaf
//! functions).

#![forbid(unsafe_code)]

pub mod bar_mapping;
pub mod cfg_space_emu;
pub mod spec;
