//! Tear down a virtual app: resolve its outcome through both capital locks.
//!
//! The endpoints agree on the app's final state; the intermediary, which
//! never saw the endpoint-to-endpoint updates, takes it from the params and
//! resolves the capital locks accordingly. Each direct channel uninstalls its
//! agreement with the outcome applied as free balance increments, signed as
//! an ordinary free balance set-state. Message order mirrors the install:
//! initiator -> intermediary -> responder -> intermediary -> initiator, plus
//! a final ack.

use std::collections::BTreeMap;

use super::install_virtual::{agreement_app_in, virtual_channel_address, AgreementLock};
use super::{
    assert_signed_at_index, expect_seq, opening, reply, single_signature, Context, Protocol,
    ProtocolError, ProtocolParams, Step, UninstallVirtualAppParams,
};
use crate::abiencode::types::{Address, Hash, U256};
use crate::commitments::{Commitment, UninstallCommitment};
use crate::keys::Xpub;
use crate::state::{compute_outcome, StateChannel};
use crate::wire::{CustomData, Envelope, ProcessId};

/// The virtual ledger after removal, plus the endpoint payouts.
#[derive(Debug)]
struct VirtualTeardown {
    vaddr: Address,
    candidate: StateChannel,
    token: Address,
    initiator_amount: U256,
    responder_amount: U256,
}

/// `strict` is set for the endpoints, which must reject a final state that
/// disagrees with their committed copy. The intermediary substitutes it.
fn prepare_teardown(
    ctx: &mut Context,
    params: &UninstallVirtualAppParams,
    strict: bool,
) -> Result<VirtualTeardown, ProtocolError> {
    let id = params.app_identity_hash;
    let vaddr = virtual_channel_address(
        ctx.key_cache,
        &params.initiator,
        &params.responder,
        &params.intermediary,
    )?;
    let ledger = ctx
        .virtual_channels
        .get(&vaddr)
        .ok_or(ProtocolError::NoSuchChannel(vaddr))?
        .clone();

    let app = ledger.app(id)?.clone();
    let final_app = if app.latest_state == params.final_state {
        app
    } else if strict {
        return Err(ProtocolError::FinalStateMismatch(id));
    } else {
        app.set_state(params.final_state.clone(), None)?
    };

    let token = final_app.outcome.token();
    let outcome = compute_outcome(&final_app)?;
    let initiator_root = ctx.key_cache.derive(&params.initiator, 0)?;
    let responder_root = ctx.key_cache.derive(&params.responder, 0)?;
    let mut initiator_amount = U256::zero();
    let mut responder_amount = U256::zero();
    if let Some(transfers) = outcome.get(&token) {
        for (to, amount) in transfers {
            if *to == initiator_root {
                initiator_amount = initiator_amount + *amount;
            } else if *to == responder_root {
                responder_amount = responder_amount + *amount;
            }
        }
    }

    let candidate = ledger.uninstall_app(id, &BTreeMap::new())?;
    Ok(VirtualTeardown {
        vaddr,
        candidate,
        token,
        initiator_amount,
        responder_amount,
    })
}

/// Uninstall the capital lock between `left` and `right`, crediting the
/// initiator-side payout to `left` and the responder-side payout to `right`.
fn unlock_agreement(
    ctx: &mut Context,
    left: &Xpub,
    right: &Xpub,
    teardown: &VirtualTeardown,
    virtual_id: Hash,
) -> Result<AgreementLock, ProtocolError> {
    let channel = ctx.direct_channel_between(left, right)?.clone();
    let agreement_id = agreement_app_in(&channel, virtual_id)?;
    let left_root = ctx.key_cache.derive(left, 0)?;
    let right_root = ctx.key_cache.derive(right, 0)?;

    let mut increments = BTreeMap::new();
    increments.insert(
        teardown.token,
        vec![
            (left_root, teardown.initiator_amount),
            (right_root, teardown.responder_amount),
        ],
    );
    let candidate = channel.uninstall_app(agreement_id, &increments)?;
    let digest = UninstallCommitment::new(ctx.network, &candidate).hash_to_sign();
    Ok(AgreementLock {
        multisig: channel.multisig_address(),
        candidate,
        digest,
    })
}

fn params_of(envelope: &Envelope) -> Result<UninstallVirtualAppParams, ProtocolError> {
    match &envelope.params {
        Some(ProtocolParams::UninstallVirtualApp(p)) => Ok(p.clone()),
        _ => Err(ProtocolError::MissingParams),
    }
}

#[derive(Debug)]
pub struct VirtualUninstallInitiator {
    intermediary: Xpub,
    teardown: VirtualTeardown,
    left: AgreementLock,
}

impl VirtualUninstallInitiator {
    pub fn start(
        ctx: &mut Context,
        process_id: ProcessId,
        params: UninstallVirtualAppParams,
    ) -> Result<(Self, Envelope), ProtocolError> {
        let teardown = prepare_teardown(ctx, &params, true)?;
        let left = unlock_agreement(
            ctx,
            &params.initiator,
            &params.intermediary,
            &teardown,
            params.app_identity_hash,
        )?;
        let signature = ctx.wallet.signer_for(0)?.sign_eth(left.digest);

        let envelope = opening(
            Protocol::UninstallVirtualApp,
            process_id,
            ctx.our_xpub(),
            params.intermediary,
            ProtocolParams::UninstallVirtualApp(params.clone()),
            CustomData::Signature { signature },
        );
        Ok((
            VirtualUninstallInitiator {
                intermediary: params.intermediary,
                teardown,
                left,
            },
            envelope,
        ))
    }

    pub fn receive(
        self,
        ctx: &mut Context,
        envelope: &Envelope,
    ) -> Result<Step<Self>, ProtocolError> {
        expect_seq(envelope, 4)?;
        let signature = single_signature(envelope)?;
        assert_signed_at_index(ctx.key_cache, self.left.digest, signature, &self.intermediary, 0)?;

        ctx.channels.insert(self.left.multisig, self.left.candidate);
        ctx.virtual_channels
            .insert(self.teardown.vaddr, self.teardown.candidate);

        let ack = reply(
            envelope,
            ctx.our_xpub(),
            envelope.from,
            5,
            None,
            CustomData::None,
        );
        Ok(Step::finished(
            vec![ack],
            vec![self.left.multisig, self.teardown.vaddr],
        ))
    }
}

#[derive(Debug)]
pub struct VirtualUninstallIntermediary {
    params: UninstallVirtualAppParams,
    teardown: VirtualTeardown,
    left: AgreementLock,
    right: AgreementLock,
    committed_right: bool,
}

impl VirtualUninstallIntermediary {
    pub fn respond(
        ctx: &mut Context,
        envelope: &Envelope,
    ) -> Result<(Self, Envelope), ProtocolError> {
        expect_seq(envelope, 1)?;
        let params = params_of(envelope)?;
        let their_signature = single_signature(envelope)?;

        let teardown = prepare_teardown(ctx, &params, false)?;
        let left = unlock_agreement(
            ctx,
            &params.initiator,
            &params.intermediary,
            &teardown,
            params.app_identity_hash,
        )?;
        let right = unlock_agreement(
            ctx,
            &params.intermediary,
            &params.responder,
            &teardown,
            params.app_identity_hash,
        )?;
        assert_signed_at_index(ctx.key_cache, left.digest, their_signature, &params.initiator, 0)?;

        let signature = ctx.wallet.signer_for(0)?.sign_eth(right.digest);
        let forward = reply(
            envelope,
            ctx.our_xpub(),
            params.responder,
            2,
            Some(ProtocolParams::UninstallVirtualApp(params.clone())),
            CustomData::Signature { signature },
        );
        Ok((
            VirtualUninstallIntermediary {
                params,
                teardown,
                left,
                right,
                committed_right: false,
            },
            forward,
        ))
    }

    pub fn receive(
        mut self,
        ctx: &mut Context,
        envelope: &Envelope,
    ) -> Result<Step<Self>, ProtocolError> {
        if !self.committed_right {
            expect_seq(envelope, 3)?;
            let signature = single_signature(envelope)?;
            assert_signed_at_index(
                ctx.key_cache,
                self.right.digest,
                signature,
                &self.params.responder,
                0,
            )?;

            ctx.channels
                .insert(self.right.multisig, self.right.candidate.clone());
            ctx.virtual_channels
                .insert(self.teardown.vaddr, self.teardown.candidate.clone());

            let left_sig = ctx.wallet.signer_for(0)?.sign_eth(self.left.digest);
            let to_initiator = reply(
                envelope,
                ctx.our_xpub(),
                self.params.initiator,
                4,
                None,
                CustomData::Signature { signature: left_sig },
            );
            let touched = vec![self.right.multisig, self.teardown.vaddr];
            self.committed_right = true;
            return Ok(Step::waiting(self, vec![to_initiator], touched));
        }

        expect_seq(envelope, 5)?;
        ctx.channels.insert(self.left.multisig, self.left.candidate);
        Ok(Step::finished(vec![], vec![self.left.multisig]))
    }
}

#[derive(Debug)]
pub struct VirtualUninstallResponder;

impl VirtualUninstallResponder {
    pub fn respond(ctx: &mut Context, envelope: &Envelope) -> Result<Step<Self>, ProtocolError> {
        expect_seq(envelope, 2)?;
        let params = params_of(envelope)?;
        let their_signature = single_signature(envelope)?;

        let teardown = prepare_teardown(ctx, &params, true)?;
        let right = unlock_agreement(
            ctx,
            &params.intermediary,
            &params.responder,
            &teardown,
            params.app_identity_hash,
        )?;
        assert_signed_at_index(
            ctx.key_cache,
            right.digest,
            their_signature,
            &params.intermediary,
            0,
        )?;

        let signature = ctx.wallet.signer_for(0)?.sign_eth(right.digest);
        ctx.channels.insert(right.multisig, right.candidate);
        ctx.virtual_channels
            .insert(teardown.vaddr, teardown.candidate);

        let to_intermediary = reply(
            envelope,
            ctx.our_xpub(),
            envelope.from,
            3,
            None,
            CustomData::Signature { signature },
        );
        Ok(Step::finished(
            vec![to_intermediary],
            vec![right.multisig, teardown.vaddr],
        ))
    }
}
