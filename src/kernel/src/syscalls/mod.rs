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

//! The system-call dispatcher
//!
//! One entry, dispatching on an 8-bit hypercall id. Handlers validate all
//! parameters and capabilities before mutating anything; a handler either
//! arranges the continuation of the current EC itself (usually a
//! successful finish) or fails with a status that the dispatcher turns
//! into the error finish.

#[macro_export]
macro_rules! sysc_log {
    ($cpu:expr, $fmt:tt) => {
        base::log!(
            base::io::LogFlags::KernSysc,
            concat!("CPU{}: syscall::", $fmt),
            $cpu
        )
    };
    ($cpu:expr, $fmt:tt, $($args:tt)*) => {
        base::log!(
            base::io::LogFlags::KernSysc,
            concat!("CPU{}: syscall::", $fmt),
            $cpu,
            $($args)*
        )
    };
}

#[macro_export]
macro_rules! sysc_err {
    ($e:expr, $fmt:tt) => ({
        return Err(base::errors::VerboseError::new($e, base::col::ToString::to_string($fmt)));
    });
    ($e:expr, $fmt:tt, $($args:tt)*) => ({
        return Err(base::errors::VerboseError::new($e, base::format!($fmt, $($args)*)));
    });
}

/// Fetches a typed object with the required permissions from a PD's
/// object space
macro_rules! get_obj {
    ($pd:expr, $sel:expr, $conv:ident, $need:expr, $what:expr) => {{
        match $pd.lookup_cap($sel).and_then(|c| c.$conv($need)) {
            Some(obj) => obj,
            None => sysc_err!(
                base::errors::Code::BadCap,
                "Non-{} CAP ({:#x})",
                $what,
                $sel
            ),
        }
    }};
}

mod create;
mod exchange;
mod irq;
mod misc;

use base::errors::VerboseError;
use base::hif::syscalls::Hypercall;
use base::io::LogFlags;
use base::log;

use crate::cpu::CpuId;
use crate::ec::ipc;
use crate::Kernel;

/// Dispatches the hypercall the current EC just entered with
pub fn handle(k: &Kernel, cpu: CpuId) {
    let cur = k.cpu(cpu).current();
    let id = cur.regs().sys_id();

    let res: Result<(), VerboseError> = match Hypercall::try_from(id) {
        // the IPC paths manage their continuations entirely themselves
        Ok(Hypercall::Call) => {
            ipc::sys_call(k, cpu);
            return;
        },
        Ok(Hypercall::Reply) => {
            ipc::sys_reply(k, cpu);
            return;
        },

        Ok(Hypercall::CreatePd) => create::create_pd(k, cpu, &cur),
        Ok(Hypercall::CreateEc) => create::create_ec(k, cpu, &cur),
        Ok(Hypercall::CreateSc) => create::create_sc(k, cpu, &cur),
        Ok(Hypercall::CreatePt) => create::create_pt(k, cpu, &cur),
        Ok(Hypercall::CreateSm) => create::create_sm(k, cpu, &cur),
        Ok(Hypercall::CreateKp) => create::create_kp(k, cpu, &cur),
        Ok(Hypercall::CreateVcpu) => create::create_vcpu(k, cpu, &cur),

        Ok(Hypercall::Revoke) => exchange::sys_revoke(k, cpu, &cur),
        Ok(Hypercall::PdCtrl) => exchange::sys_pd_ctrl(k, cpu, &cur),

        Ok(Hypercall::EcCtrl) => misc::sys_ec_ctrl(k, cpu, &cur),
        Ok(Hypercall::ScCtrl) => misc::sys_sc_ctrl(k, cpu, &cur),
        Ok(Hypercall::PtCtrl) => misc::sys_pt_ctrl(k, cpu, &cur),
        Ok(Hypercall::SmCtrl) => misc::sys_sm_ctrl(k, cpu, &cur),
        Ok(Hypercall::KpCtrl) => misc::sys_kp_ctrl(k, cpu, &cur),
        Ok(Hypercall::VcpuCtrl) => misc::sys_vcpu_ctrl(k, cpu, &cur),
        Ok(Hypercall::MachineCtrl) => misc::sys_machine_ctrl(k, cpu, &cur),

        Ok(Hypercall::AssignPci) => irq::sys_assign_pci(k, cpu, &cur),
        Ok(Hypercall::IrqCtrl) => irq::sys_irq_ctrl(k, cpu, &cur),

        Err(_) => {
            ipc::sys_finish(k, cpu, base::errors::Code::BadHyp, false);
            return;
        },
    };

    match res {
        Ok(()) => {
        },
        Err(e) => {
            log!(
                LogFlags::Error,
                "CPU{}: hypercall {} failed: {} ({:?})",
                cpu,
                id,
                e.msg(),
                e.code()
            );
            ipc::sys_finish(k, cpu, e.code().to_syscall(), false);
        },
    }
}

#[cfg(test)]
mod syscall_test;
