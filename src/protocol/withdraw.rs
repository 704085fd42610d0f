//! Withdraw: move funds from the free balance out of the multisig.
//!
//! Two messages, signed with the root keys. The commitment batches the
//! on-chain transfer with a registration of the reduced free balance, so the
//! withdrawer cannot both withdraw and later dispute with the old balance.

use super::{
    assert_signed_at_index, counterparty_of, expect_sender, expect_seq, opening, reply,
    single_signature, Context, Protocol, ProtocolError, ProtocolParams, Step, WithdrawParams,
};
use crate::abiencode::types::{Address, Hash};
use crate::commitments::{Commitment, WithdrawCommitment};
use crate::keys::Xpub;
use crate::state::StateChannel;
use crate::wire::{CustomData, Envelope, ProcessId};

fn withdraw_candidate(
    ctx: &mut Context,
    params: &WithdrawParams,
    withdrawer: &Xpub,
) -> Result<(StateChannel, Hash), ProtocolError> {
    let channel = ctx
        .channels
        .get(&params.multisig_address)
        .ok_or(ProtocolError::NoSuchChannel(params.multisig_address))?
        .clone();
    let root = channel.root_address_of(withdrawer, ctx.key_cache)?;
    let candidate = channel.withdraw(params.token, root, params.amount)?;
    let digest = WithdrawCommitment::new(
        ctx.network,
        &candidate,
        params.token,
        params.recipient,
        params.amount,
    )
    .hash_to_sign();
    Ok((candidate, digest))
}

#[derive(Debug)]
pub struct WithdrawInitiator {
    multisig: Address,
    counterparty: Xpub,
    candidate: StateChannel,
    digest: Hash,
}

impl WithdrawInitiator {
    pub fn start(
        ctx: &mut Context,
        process_id: ProcessId,
        params: WithdrawParams,
    ) -> Result<(Self, Envelope), ProtocolError> {
        let our = ctx.our_xpub();
        let (candidate, digest) = withdraw_candidate(ctx, &params, &our)?;
        let counterparty = counterparty_of(&candidate, &our);
        let signature = ctx.wallet.signer_for(0)?.sign_eth(digest);

        let envelope = opening(
            Protocol::Withdraw,
            process_id,
            our,
            counterparty,
            ProtocolParams::Withdraw(params),
            CustomData::Signature { signature },
        );
        Ok((
            WithdrawInitiator {
                multisig: candidate.multisig_address(),
                counterparty,
                candidate,
                digest,
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
        let signature = single_signature(envelope)?;
        assert_signed_at_index(ctx.key_cache, self.digest, signature, &self.counterparty, 0)?;

        ctx.channels.insert(self.multisig, self.candidate);
        Ok(Step::finished(vec![], vec![self.multisig]))
    }
}

#[derive(Debug)]
pub struct WithdrawResponder;

impl WithdrawResponder {
    pub fn respond(ctx: &mut Context, envelope: &Envelope) -> Result<Step<Self>, ProtocolError> {
        expect_seq(envelope, 1)?;
        let params = match &envelope.params {
            Some(ProtocolParams::Withdraw(p)) => p.clone(),
            _ => return Err(ProtocolError::MissingParams),
        };
        let their_signature = single_signature(envelope)?;

        let our = ctx.our_xpub();
        let channel = ctx
            .channels
            .get(&params.multisig_address)
            .ok_or(ProtocolError::NoSuchChannel(params.multisig_address))?;
        let counterparty = expect_sender(channel, &our, envelope)?;

        // The deduction always hits the initiator's side of the balance.
        let (candidate, digest) = withdraw_candidate(ctx, &params, &counterparty)?;
        assert_signed_at_index(ctx.key_cache, digest, their_signature, &counterparty, 0)?;

        let signature = ctx.wallet.signer_for(0)?.sign_eth(digest);
        let multisig = candidate.multisig_address();
        ctx.channels.insert(multisig, candidate);

        let ack = reply(
            envelope,
            our,
            counterparty,
            2,
            None,
            CustomData::Signature { signature },
        );
        Ok(Step::finished(vec![ack], vec![multisig]))
    }
}
