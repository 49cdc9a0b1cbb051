/*
 * Copyright (C) 2025-2026 The Caldera authors
 *
 * This file is part of Caldera (a capability-based microhypervisor for x86-64).
 *
 * Caldera is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License version 2 as
 * published by the Free Software Foundation.
 *
 * Caldera is distributed in the hope that it will be useful, but
 * WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU
 * General Public License version 2 for more details.
 */

//! Kernel command line parsing

use base::io::LogFlags;

use crate::platform::{Features, Platform};

/// The recognized kernel arguments
#[derive(Default)]
pub struct Args {
    /// `log=<flags>`: the enabled log flags
    pub log: Option<LogFlags>,
    /// `novmx`: do not offer vCPUs even if the CPU could
    pub novmx: bool,
    /// `noiommu`: ignore registered DMAR units
    pub noiommu: bool,
}

impl Args {
    /// Folds the switches into the platform description
    pub fn apply(&self, mut platform: Platform) -> Platform {
        if self.novmx {
            platform.clear_feature(Features::VMX);
        }
        if self.noiommu {
            platform.clear_feature(Features::IOMMU);
        }
        platform
    }
}

/// Parses the space-separated kernel command line
pub fn parse(cmdline: &str) -> Args {
    let mut args = Args::default();

    for word in cmdline.split_ascii_whitespace() {
        if let Some(flags) = word.strip_prefix("log=") {
            args.log = flags.parse().ok();
        }
        else if word == "novmx" {
            args.novmx = true;
        }
        else if word == "noiommu" {
            args.noiommu = true;
        }
    }

    args
}
