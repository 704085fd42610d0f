//! Install a virtual app between two parties that share no multisig,
//! routed through an intermediary both of them have a direct channel with.
//!
//! The app itself lives in a synthetic ledger between the endpoints, keyed by
//! an address derived from the three parties. Its funding is not held there:
//! each direct channel installs a capital-lock agreement binding the full
//! capital to the virtual app's outcome, with the intermediary fronting the
//! remote endpoint's share. After the final outcome, the intermediary's two
//! locks cancel out and it ends net neutral.
//!
//! Five messages:
//!
//! 1. initiator -> intermediary: params, initiator's virtual set-state and
//!    left-agreement signatures
//! 2. intermediary -> responder: params, initiator's virtual set-state and
//!    intermediary's right-agreement signatures
//! 3. responder -> intermediary: responder's virtual set-state and
//!    right-agreement signatures (responder commits here)
//! 4. intermediary -> initiator: responder's virtual set-state, the
//!    intermediary's expiry-bounded set-state and left-agreement signatures
//!    (intermediary commits its right channel here)
//! 5. initiator -> intermediary: ack (initiator committed; intermediary
//!    commits its left channel)
//!
//! The endpoints sign the virtual set-state with their per-app derived keys;
//! the intermediary signs the expiry-bounded variant with its root key, so it
//! never needs to see any later endpoint-to-endpoint state update.

use super::{
    assert_signed_at_index, expect_seq, opening, reply, Context, InstallVirtualAppParams,
    Protocol, ProtocolError, ProtocolParams, Step,
};
use crate::abiencode::{
    types::{Address, Hash, Signature},
    AbiEncodings, AbiType, AbiValue, PackedEncoder,
};
use crate::commitments::{Commitment, VirtualAppAgreementCommitment, VirtualAppSetStateCommitment};
use crate::keys::{KeyCache, Xpub};
use crate::state::{AppInstance, OutcomeSpec, StateChannel};
use crate::wire::{CustomData, Envelope, ProcessId};

/// Deterministic address of the synthetic ledger between the endpoints: all
/// three parties derive it independently from the same inputs.
pub(crate) fn virtual_channel_address(
    cache: &mut KeyCache,
    initiator: &Xpub,
    responder: &Xpub,
    intermediary: &Xpub,
) -> Result<Address, ProtocolError> {
    let endpoints = cache.sorted_addresses(&[*initiator, *responder], 0)?;
    let hash = PackedEncoder::new()
        .push_address(endpoints[0])
        .push_address(endpoints[1])
        .push_address(cache.derive(intermediary, 0)?)
        .keccak();
    let mut addr = Address([0; 20]);
    addr.0.copy_from_slice(&hash.0[12..]);
    Ok(addr)
}

/// Find the capital-lock agreement for `virtual_id` inside a direct channel.
pub(crate) fn agreement_app_in(
    channel: &StateChannel,
    virtual_id: Hash,
) -> Result<Hash, ProtocolError> {
    channel
        .apps()
        .find(|app| app.latest_state == [AbiValue::Bytes32(virtual_id)])
        .map(AppInstance::identity_hash)
        .ok_or(ProtocolError::AppNotFound(virtual_id))
}

/// The virtual ledger after installing the app, plus the digests each role
/// signs.
#[derive(Debug)]
pub(crate) struct VirtualSetup {
    pub vaddr: Address,
    pub candidate: StateChannel,
    pub app_identity: Hash,
    pub endpoint_digest: Hash,
    pub intermediary_digest: Hash,
    /// Derivation index of the endpoints' set-state keys.
    pub signing_index: u32,
}

pub(crate) fn prepare_virtual(
    ctx: &mut Context,
    params: &InstallVirtualAppParams,
) -> Result<VirtualSetup, ProtocolError> {
    let vaddr =
        virtual_channel_address(ctx.key_cache, &params.initiator, &params.responder, &params.intermediary)?;
    let ledger = match ctx.virtual_channels.get(&vaddr) {
        Some(existing) => existing.clone(),
        None => StateChannel::setup(
            ctx.network,
            vaddr,
            &[params.initiator, params.responder],
            ctx.key_cache,
        )?,
    };

    let app_seq_no = ledger.next_app_seq_no();
    let signing_keys = ledger.signing_keys_for(app_seq_no, ctx.key_cache)?;
    let initiator_root = ctx.key_cache.derive(&params.initiator, 0)?;
    let responder_root = ctx.key_cache.derive(&params.responder, 0)?;

    let app = AppInstance {
        multisig_address: vaddr,
        signing_keys,
        app_definition: params.app_definition,
        abi_encodings: params.abi_encodings.clone(),
        default_timeout: params.default_timeout,
        app_seq_no,
        latest_state: params.initial_state.clone(),
        latest_version_number: 0,
        latest_timeout: params.default_timeout,
        outcome: OutcomeSpec::TwoPartyFixedOutcome {
            token: params.token,
            amount: params.capital()?,
            beneficiaries: [initiator_root, responder_root],
        },
    };
    let app_identity = app.identity_hash();
    let state_hash = app.state_hash()?;

    // The ledger holds no funds; the capital sits in the direct channels.
    let candidate = ledger.install_prepared(app, &[])?;

    let commitment = VirtualAppSetStateCommitment {
        challenge_registry: ctx.network.challenge_registry,
        app_identity_hash: app_identity,
        state_hash,
        version_number: 0,
        timeout: params.default_timeout,
    };
    Ok(VirtualSetup {
        vaddr,
        candidate,
        app_identity,
        endpoint_digest: commitment.hash_to_sign(false),
        intermediary_digest: commitment.hash_to_sign(true),
        signing_index: app_seq_no as u32,
    })
}

/// One direct channel with the capital lock installed but not committed.
#[derive(Debug)]
pub(crate) struct AgreementLock {
    pub multisig: Address,
    pub candidate: StateChannel,
    pub digest: Hash,
}

/// Install the capital lock in the direct channel between `left` and
/// `right`, with `left` funding the initiator's share and `right` the
/// responder's.
pub(crate) fn lock_agreement(
    ctx: &mut Context,
    left: &Xpub,
    right: &Xpub,
    params: &InstallVirtualAppParams,
    virtual_id: Hash,
) -> Result<AgreementLock, ProtocolError> {
    let channel = ctx.direct_channel_between(left, right)?.clone();
    let left_root = ctx.key_cache.derive(left, 0)?;
    let right_root = ctx.key_cache.derive(right, 0)?;

    let app_seq_no = channel.next_app_seq_no();
    let app = AppInstance {
        multisig_address: channel.multisig_address(),
        signing_keys: channel.signing_keys_for(app_seq_no, ctx.key_cache)?,
        app_definition: ctx.network.identity_app,
        abi_encodings: AbiEncodings {
            state: vec![AbiType::Bytes32],
            action: None,
        },
        default_timeout: params.default_timeout,
        app_seq_no,
        latest_state: vec![AbiValue::Bytes32(virtual_id)],
        latest_version_number: 0,
        latest_timeout: params.default_timeout,
        outcome: OutcomeSpec::TwoPartyFixedOutcome {
            token: params.token,
            amount: params.capital()?,
            beneficiaries: [left_root, right_root],
        },
    };

    let candidate = channel.install_prepared(
        app,
        &[
            (params.token, left_root, params.initiator_deposit),
            (params.token, right_root, params.responder_deposit),
        ],
    )?;

    let digest = VirtualAppAgreementCommitment::new(
        ctx.network,
        channel.multisig_address(),
        virtual_id,
        params.token,
        params.capital()?,
        [left_root, right_root],
    )
    .hash_to_sign();

    Ok(AgreementLock {
        multisig: channel.multisig_address(),
        candidate,
        digest,
    })
}

fn params_of(envelope: &Envelope) -> Result<InstallVirtualAppParams, ProtocolError> {
    match &envelope.params {
        Some(ProtocolParams::InstallVirtualApp(p)) => Ok(p.clone()),
        _ => Err(ProtocolError::MissingParams),
    }
}

fn pair(envelope: &Envelope) -> Result<[Signature; 2], ProtocolError> {
    envelope
        .custom_data
        .pair()
        .ok_or(ProtocolError::MissingSignatures)
}

fn triple(envelope: &Envelope) -> Result<[Signature; 3], ProtocolError> {
    envelope
        .custom_data
        .triple()
        .ok_or(ProtocolError::MissingSignatures)
}

#[derive(Debug)]
pub struct VirtualInstallInitiator {
    params: InstallVirtualAppParams,
    setup: VirtualSetup,
    left: AgreementLock,
}

impl VirtualInstallInitiator {
    pub fn start(
        ctx: &mut Context,
        process_id: ProcessId,
        params: InstallVirtualAppParams,
    ) -> Result<(Self, Envelope), ProtocolError> {
        let setup = prepare_virtual(ctx, &params)?;
        let left = lock_agreement(
            ctx,
            &params.initiator,
            &params.intermediary,
            &params,
            setup.app_identity,
        )?;

        let virtual_sig = ctx
            .wallet
            .signer_for(setup.signing_index)?
            .sign_eth(setup.endpoint_digest);
        let agreement_sig = ctx.wallet.signer_for(0)?.sign_eth(left.digest);

        let envelope = opening(
            Protocol::InstallVirtualApp,
            process_id,
            ctx.our_xpub(),
            params.intermediary,
            ProtocolParams::InstallVirtualApp(params.clone()),
            CustomData::SignaturePair {
                signatures: [virtual_sig, agreement_sig],
            },
        );
        Ok((
            VirtualInstallInitiator {
                params,
                setup,
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
        let [responder_virtual, intermediary_virtual, intermediary_agreement] = triple(envelope)?;

        assert_signed_at_index(
            ctx.key_cache,
            self.setup.endpoint_digest,
            responder_virtual,
            &self.params.responder,
            self.setup.signing_index,
        )?;
        assert_signed_at_index(
            ctx.key_cache,
            self.setup.intermediary_digest,
            intermediary_virtual,
            &self.params.intermediary,
            0,
        )?;
        assert_signed_at_index(
            ctx.key_cache,
            self.left.digest,
            intermediary_agreement,
            &self.params.intermediary,
            0,
        )?;

        ctx.virtual_channels.insert(self.setup.vaddr, self.setup.candidate);
        ctx.channels.insert(self.left.multisig, self.left.candidate);

        let ack = reply(
            envelope,
            ctx.our_xpub(),
            envelope.from,
            5,
            None,
            CustomData::None,
        );
        Ok(Step::finished(vec![ack], vec![self.left.multisig, self.setup.vaddr]))
    }
}

#[derive(Debug)]
pub struct VirtualInstallIntermediary {
    params: InstallVirtualAppParams,
    setup: VirtualSetup,
    left: AgreementLock,
    right: AgreementLock,
    /// Set once the responder's reply has been verified; the left channel
    /// commits only after the initiator's final ack.
    committed_right: bool,
}

impl VirtualInstallIntermediary {
    pub fn respond(
        ctx: &mut Context,
        envelope: &Envelope,
    ) -> Result<(Self, Envelope), ProtocolError> {
        expect_seq(envelope, 1)?;
        let params = params_of(envelope)?;
        let [initiator_virtual, initiator_agreement] = pair(envelope)?;

        let setup = prepare_virtual(ctx, &params)?;
        let left = lock_agreement(
            ctx,
            &params.initiator,
            &params.intermediary,
            &params,
            setup.app_identity,
        )?;
        let right = lock_agreement(
            ctx,
            &params.intermediary,
            &params.responder,
            &params,
            setup.app_identity,
        )?;

        assert_signed_at_index(
            ctx.key_cache,
            setup.endpoint_digest,
            initiator_virtual,
            &params.initiator,
            setup.signing_index,
        )?;
        assert_signed_at_index(
            ctx.key_cache,
            left.digest,
            initiator_agreement,
            &params.initiator,
            0,
        )?;

        let right_sig = ctx.wallet.signer_for(0)?.sign_eth(right.digest);
        let forward = reply(
            envelope,
            ctx.our_xpub(),
            params.responder,
            2,
            Some(ProtocolParams::InstallVirtualApp(params.clone())),
            CustomData::SignaturePair {
                signatures: [initiator_virtual, right_sig],
            },
        );
        Ok((
            VirtualInstallIntermediary {
                params,
                setup,
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
            let [responder_virtual, responder_agreement] = pair(envelope)?;

            assert_signed_at_index(
                ctx.key_cache,
                self.setup.endpoint_digest,
                responder_virtual,
                &self.params.responder,
                self.setup.signing_index,
            )?;
            assert_signed_at_index(
                ctx.key_cache,
                self.right.digest,
                responder_agreement,
                &self.params.responder,
                0,
            )?;

            ctx.channels
                .insert(self.right.multisig, self.right.candidate.clone());

            let intermediary_virtual = ctx
                .wallet
                .signer_for(0)?
                .sign_eth(self.setup.intermediary_digest);
            let left_sig = ctx.wallet.signer_for(0)?.sign_eth(self.left.digest);
            let to_initiator = reply(
                envelope,
                ctx.our_xpub(),
                self.params.initiator,
                4,
                None,
                CustomData::SignatureTriple {
                    signatures: [responder_virtual, intermediary_virtual, left_sig],
                },
            );
            let right_multisig = self.right.multisig;
            self.committed_right = true;
            return Ok(Step::waiting(self, vec![to_initiator], vec![right_multisig]));
        }

        expect_seq(envelope, 5)?;
        ctx.channels.insert(self.left.multisig, self.left.candidate);
        ctx.virtual_channels
            .insert(self.setup.vaddr, self.setup.candidate);
        Ok(Step::finished(vec![], vec![self.left.multisig, self.setup.vaddr]))
    }
}

#[derive(Debug)]
pub struct VirtualInstallResponder;

impl VirtualInstallResponder {
    pub fn respond(ctx: &mut Context, envelope: &Envelope) -> Result<Step<Self>, ProtocolError> {
        expect_seq(envelope, 2)?;
        let params = params_of(envelope)?;
        let [initiator_virtual, intermediary_agreement] = pair(envelope)?;

        let setup = prepare_virtual(ctx, &params)?;
        let right = lock_agreement(
            ctx,
            &params.intermediary,
            &params.responder,
            &params,
            setup.app_identity,
        )?;

        assert_signed_at_index(
            ctx.key_cache,
            setup.endpoint_digest,
            initiator_virtual,
            &params.initiator,
            setup.signing_index,
        )?;
        assert_signed_at_index(
            ctx.key_cache,
            right.digest,
            intermediary_agreement,
            &params.intermediary,
            0,
        )?;

        let virtual_sig = ctx
            .wallet
            .signer_for(setup.signing_index)?
            .sign_eth(setup.endpoint_digest);
        let agreement_sig = ctx.wallet.signer_for(0)?.sign_eth(right.digest);

        ctx.channels.insert(right.multisig, right.candidate);
        ctx.virtual_channels.insert(setup.vaddr, setup.candidate);

        let to_intermediary = reply(
            envelope,
            ctx.our_xpub(),
            envelope.from,
            3,
            None,
            CustomData::SignaturePair {
                signatures: [virtual_sig, agreement_sig],
            },
        );
        Ok(Step::finished(
            vec![to_intermediary],
            vec![right.multisig, setup.vaddr],
        ))
    }
}
