//! Propose-install: record a pending app proposal on both sides.
//!
//! Two messages, no signatures. A proposal moves no funds; it only reserves
//! the next app sequence number and pins the parameters a later Install must
//! use. Both parties derive the same identity hash from the same inputs, so
//! the hash itself never goes over the wire.

use super::{
    expect_seq, opening, reply, Context, ProposeParams, Protocol, ProtocolError, ProtocolParams,
    Step,
};
use crate::abiencode::types::Address;
use crate::keys::Xpub;
use crate::state::{identity_hash, AppInstanceProposal, StateChannel};
use crate::wire::{CustomData, Envelope, ProcessId};

fn build_proposal(
    ctx: &mut Context,
    channel: &StateChannel,
    proposed_by: Xpub,
    proposed_to: Xpub,
    params: &ProposeParams,
) -> Result<AppInstanceProposal, ProtocolError> {
    let app_seq_no = channel.next_app_seq_no();
    let signing_keys = channel.signing_keys_for(app_seq_no, ctx.key_cache)?;
    Ok(AppInstanceProposal {
        identity_hash: identity_hash(
            &signing_keys,
            params.app_definition,
            params.default_timeout,
            app_seq_no,
        ),
        app_seq_no,
        proposed_by,
        proposed_to,
        app_definition: params.app_definition,
        abi_encodings: params.abi_encodings.clone(),
        initiator_deposit: params.initiator_deposit,
        initiator_deposit_token: params.initiator_deposit_token,
        responder_deposit: params.responder_deposit,
        responder_deposit_token: params.responder_deposit_token,
        default_timeout: params.default_timeout,
        initial_state: params.initial_state.clone(),
        outcome: params.outcome.clone(),
        intermediary: None,
    })
}

#[derive(Debug)]
pub struct ProposeInitiator {
    multisig: Address,
    candidate: StateChannel,
}

impl ProposeInitiator {
    pub fn start(
        ctx: &mut Context,
        process_id: ProcessId,
        params: ProposeParams,
    ) -> Result<(Self, Envelope), ProtocolError> {
        let our = ctx.our_xpub();
        let channel = ctx.direct_channel_between(&our, &params.responder)?.clone();
        let proposal = build_proposal(ctx, &channel, our, params.responder, &params)?;
        let candidate = channel.add_proposal(proposal)?;

        let envelope = opening(
            Protocol::Propose,
            process_id,
            our,
            params.responder,
            ProtocolParams::Propose(params),
            CustomData::None,
        );
        Ok((
            ProposeInitiator {
                multisig: channel.multisig_address(),
                candidate,
            },
            envelope,
        ))
    }

    pub fn receive(
        self,
        ctx: &mut Context,
        envelope: &Envelope,
    ) -> Result<Step<Self>, ProtocolError> {
        expect_seq(envelope, 2)?;
        ctx.channels.insert(self.multisig, self.candidate);
        Ok(Step::finished(vec![], vec![self.multisig]))
    }
}

#[derive(Debug)]
pub struct ProposeResponder;

impl ProposeResponder {
    pub fn respond(ctx: &mut Context, envelope: &Envelope) -> Result<Step<Self>, ProtocolError> {
        expect_seq(envelope, 1)?;
        let params = match &envelope.params {
            Some(ProtocolParams::Propose(p)) => p.clone(),
            _ => return Err(ProtocolError::MissingParams),
        };

        let our = ctx.our_xpub();
        let channel = ctx.direct_channel_between(&envelope.from, &our)?.clone();
        let proposal = build_proposal(ctx, &channel, envelope.from, our, &params)?;
        let candidate = channel.add_proposal(proposal)?;

        let multisig = channel.multisig_address();
        ctx.channels.insert(multisig, candidate);

        let ack = reply(envelope, our, envelope.from, 2, None, CustomData::None);
        Ok(Step::finished(vec![ack], vec![multisig]))
    }
}
