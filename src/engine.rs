//! Dispatch layer over the protocol role machines.
//!
//! [`Machine`] is the closed sum of every role that survives past its first
//! message. Starting a protocol yields a machine plus the opening envelope;
//! an incoming first message either completes a responder role on the spot
//! or yields a machine for the roles with further steps. Both paths go
//! through exhaustive matches, so a new protocol cannot be half wired up.

pub use crate::protocol::{Context, Step};

use crate::protocol::{
    install::{InstallInitiator, InstallResponder},
    install_virtual::{
        VirtualInstallInitiator, VirtualInstallIntermediary, VirtualInstallResponder,
    },
    propose::{ProposeInitiator, ProposeResponder},
    setup::{SetupInitiator, SetupResponder},
    take_action::{TakeActionInitiator, TakeActionResponder},
    uninstall::{UninstallInitiator, UninstallResponder},
    uninstall_virtual::{
        VirtualUninstallInitiator, VirtualUninstallIntermediary, VirtualUninstallResponder,
    },
    withdraw::{WithdrawInitiator, WithdrawResponder},
    Protocol, ProtocolError, ProtocolParams,
};
use crate::wire::{Envelope, ProcessId};

/// A protocol role suspended mid-instance, waiting for its next message.
#[derive(Debug)]
pub enum Machine {
    SetupInitiator(SetupInitiator),
    ProposeInitiator(ProposeInitiator),
    InstallInitiator(InstallInitiator),
    TakeActionInitiator(TakeActionInitiator),
    UninstallInitiator(UninstallInitiator),
    WithdrawInitiator(WithdrawInitiator),
    VirtualInstallInitiator(VirtualInstallInitiator),
    VirtualInstallIntermediary(VirtualInstallIntermediary),
    VirtualUninstallInitiator(VirtualUninstallInitiator),
    VirtualUninstallIntermediary(VirtualUninstallIntermediary),
}

fn map<M>(step: Step<M>, wrap: fn(M) -> Machine) -> Step<Machine> {
    Step {
        next: step.next.map(wrap),
        send: step.send,
        touched: step.touched,
    }
}

/// Start a protocol as its initiator. Returns the suspended machine and the
/// opening envelope to put on the wire.
pub fn initiate(
    ctx: &mut Context,
    process_id: ProcessId,
    params: ProtocolParams,
) -> Result<(Machine, Envelope), ProtocolError> {
    Ok(match params {
        ProtocolParams::Setup(p) => {
            let (m, env) = SetupInitiator::start(ctx, process_id, p)?;
            (Machine::SetupInitiator(m), env)
        }
        ProtocolParams::Propose(p) => {
            let (m, env) = ProposeInitiator::start(ctx, process_id, p)?;
            (Machine::ProposeInitiator(m), env)
        }
        ProtocolParams::Install(p) => {
            let (m, env) = InstallInitiator::start(ctx, process_id, p)?;
            (Machine::InstallInitiator(m), env)
        }
        ProtocolParams::InstallVirtualApp(p) => {
            let (m, env) = VirtualInstallInitiator::start(ctx, process_id, p)?;
            (Machine::VirtualInstallInitiator(m), env)
        }
        ProtocolParams::TakeAction(p) => {
            let (m, env) = TakeActionInitiator::start(ctx, process_id, p)?;
            (Machine::TakeActionInitiator(m), env)
        }
        ProtocolParams::Uninstall(p) => {
            let (m, env) = UninstallInitiator::start(ctx, process_id, p)?;
            (Machine::UninstallInitiator(m), env)
        }
        ProtocolParams::UninstallVirtualApp(p) => {
            let (m, env) = VirtualUninstallInitiator::start(ctx, process_id, p)?;
            (Machine::VirtualUninstallInitiator(m), env)
        }
        ProtocolParams::Withdraw(p) => {
            let (m, env) = WithdrawInitiator::start(ctx, process_id, p)?;
            (Machine::WithdrawInitiator(m), env)
        }
    })
}

/// Handle the first message of an instance we did not start.
pub fn respond(ctx: &mut Context, envelope: &Envelope) -> Result<Step<Machine>, ProtocolError> {
    match (envelope.protocol, envelope.seq) {
        (Protocol::Setup, 1) => {
            SetupResponder::respond(ctx, envelope).map(|s| map(s, never))
        }
        (Protocol::Propose, 1) => {
            ProposeResponder::respond(ctx, envelope).map(|s| map(s, never))
        }
        (Protocol::Install, 1) => {
            InstallResponder::respond(ctx, envelope).map(|s| map(s, never))
        }
        (Protocol::TakeAction, 1) => {
            TakeActionResponder::respond(ctx, envelope).map(|s| map(s, never))
        }
        (Protocol::Uninstall, 1) => {
            UninstallResponder::respond(ctx, envelope).map(|s| map(s, never))
        }
        (Protocol::Withdraw, 1) => {
            WithdrawResponder::respond(ctx, envelope).map(|s| map(s, never))
        }
        (Protocol::InstallVirtualApp, 1) => {
            let (m, forward) = VirtualInstallIntermediary::respond(ctx, envelope)?;
            Ok(Step::waiting(
                Machine::VirtualInstallIntermediary(m),
                vec![forward],
                vec![],
            ))
        }
        (Protocol::InstallVirtualApp, 2) => VirtualInstallResponder::respond(ctx, envelope)
            .map(|s| map(s, never)),
        (Protocol::UninstallVirtualApp, 1) => {
            let (m, forward) = VirtualUninstallIntermediary::respond(ctx, envelope)?;
            Ok(Step::waiting(
                Machine::VirtualUninstallIntermediary(m),
                vec![forward],
                vec![],
            ))
        }
        (Protocol::UninstallVirtualApp, 2) => VirtualUninstallResponder::respond(ctx, envelope)
            .map(|s| map(s, never)),
        (_, got) => Err(ProtocolError::UnexpectedMessage { expected: 1, got }),
    }
}

// The single-step responders never suspend, so their `next` is always None
// and this wrapper is never called.
fn never<M>(_: M) -> Machine {
    unreachable!("single-step responder suspended")
}

impl Machine {
    /// Feed a follow-up message of this instance into the suspended role.
    pub fn receive(
        self,
        ctx: &mut Context,
        envelope: &Envelope,
    ) -> Result<Step<Machine>, ProtocolError> {
        match self {
            Machine::SetupInitiator(m) => Ok(map(m.receive(ctx, envelope)?, Machine::SetupInitiator)),
            Machine::ProposeInitiator(m) => {
                Ok(map(m.receive(ctx, envelope)?, Machine::ProposeInitiator))
            }
            Machine::InstallInitiator(m) => {
                Ok(map(m.receive(ctx, envelope)?, Machine::InstallInitiator))
            }
            Machine::TakeActionInitiator(m) => {
                Ok(map(m.receive(ctx, envelope)?, Machine::TakeActionInitiator))
            }
            Machine::UninstallInitiator(m) => {
                Ok(map(m.receive(ctx, envelope)?, Machine::UninstallInitiator))
            }
            Machine::WithdrawInitiator(m) => {
                Ok(map(m.receive(ctx, envelope)?, Machine::WithdrawInitiator))
            }
            Machine::VirtualInstallInitiator(m) => Ok(map(
                m.receive(ctx, envelope)?,
                Machine::VirtualInstallInitiator,
            )),
            Machine::VirtualInstallIntermediary(m) => Ok(map(
                m.receive(ctx, envelope)?,
                Machine::VirtualInstallIntermediary,
            )),
            Machine::VirtualUninstallInitiator(m) => Ok(map(
                m.receive(ctx, envelope)?,
                Machine::VirtualUninstallInitiator,
            )),
            Machine::VirtualUninstallIntermediary(m) => Ok(map(
                m.receive(ctx, envelope)?,
                Machine::VirtualUninstallIntermediary,
            )),
        }
    }
}
