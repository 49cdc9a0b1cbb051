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

//! Contains the error handling types

use core::fmt;

use alloc::string::String;

/// The status codes
///
/// The first block is the user-visible status set returned at the hypercall
/// boundary; the second block is kernel-internal and folded onto the user set
/// before a syscall returns (see [`Code::to_syscall`]).
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u32)]
pub enum Code {
    // hypercall status codes
    Success = 0,
    /// Communication timed out, was cancelled, or a help chain livelocked
    ComTim,
    /// The partner or caller died during communication
    ComAbt,
    /// Unknown hypercall id
    BadHyp,
    /// Capability selector absent, wrong type, or insufficient permission
    BadCap,
    /// Malformed parameter
    BadPar,
    /// Target lives on a different CPU
    BadCpu,
    /// Device not found or not assigned
    BadDev,
    /// Feature unsupported on this CPU or disabled
    BadFtr,
    /// Allocation failed
    OutOfMem,

    // kernel-internal codes
    /// A mapping could not be established (permissions, alignment, overlap)
    InvalidMapping,
    /// An entry exists where none was expected
    Exists,
    /// No entry found
    NotFound,
}

impl Code {
    /// Folds kernel-internal codes onto the user-visible status set
    pub fn to_syscall(self) -> Code {
        match self {
            Code::InvalidMapping => Code::BadPar,
            Code::Exists => Code::BadCap,
            Code::NotFound => Code::BadCap,
            c => c,
        }
    }
}

impl Default for Code {
    fn default() -> Self {
        Self::Success
    }
}

impl From<u32> for Code {
    fn from(val: u32) -> Self {
        if val > Code::NotFound as u32 {
            return Code::BadPar;
        }
        // the repr is contiguous starting at 0
        unsafe { core::mem::transmute(val) }
    }
}

/// The struct that stores information about an occurred error
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Error {
    code: Code,
}

impl Error {
    /// Creates a new error with given code
    pub const fn new(code: Code) -> Self {
        Error { code }
    }

    /// Returns the error code
    pub fn code(&self) -> Code {
        self.code
    }
}

impl From<Code> for Error {
    fn from(code: Code) -> Self {
        Error::new(code)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.code)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.code)
    }
}

/// An error with an additional message, used at the syscall boundary to log
/// why a request was refused
pub struct VerboseError {
    code: Code,
    msg: String,
}

impl VerboseError {
    pub fn new(code: Code, msg: String) -> Self {
        VerboseError { code, msg }
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn msg(&self) -> &str {
        &self.msg
    }
}

impl From<Error> for VerboseError {
    fn from(e: Error) -> Self {
        VerboseError::new(e.code(), String::new())
    }
}

impl fmt::Debug for VerboseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.msg)
    }
}

impl fmt::Display for VerboseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.msg)
    }
}
