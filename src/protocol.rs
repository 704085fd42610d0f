//! The protocol catalogue and its shared plumbing.
//!
//! A protocol is a named, multi-step signature exchange between two (or, for
//! the virtual app protocols, three) parties. Each protocol is implemented as
//! a pair or triple of explicit role state machines in its own submodule:
//! the initiator builds the first message, every other role is instantiated
//! by the first message it receives. Machines never perform I/O; they consume
//! an [`Envelope`], mutate their candidate state and hand any outbound
//! envelopes back to the caller.
//!
//! Commitment state is only written back to [`Context::channels`] at the
//! step where the machine has verified every signature it depends on. A
//! machine that errors mid-protocol therefore leaves the committed ledger
//! untouched.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::abiencode::{
    self,
    types::{Address, Hash, Signature, U256},
    AbiEncodings, AbiValue,
};
use crate::keys::{self, KeyCache, Wallet, Xpub};
use crate::network::NetworkContext;
use crate::sig::{self, assert_signed_by};
use crate::state::{self, OutcomeSpec, StateChannel};
use crate::wire::{CustomData, Envelope, ProcessId};

pub mod install;
pub mod install_virtual;
pub mod propose;
pub mod setup;
pub mod take_action;
pub mod uninstall;
pub mod uninstall_virtual;
pub mod withdraw;

/// Every protocol this engine speaks. Closed on purpose: the engine matches
/// exhaustively, so adding a protocol is a compile-time checklist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Setup,
    Propose,
    Install,
    InstallVirtualApp,
    TakeAction,
    Uninstall,
    UninstallVirtualApp,
    Withdraw,
}

impl core::fmt::Display for Protocol {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupParams {
    pub multisig_address: Address,
    pub initiator: Xpub,
    pub responder: Xpub,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposeParams {
    pub responder: Xpub,
    pub app_definition: Address,
    pub abi_encodings: AbiEncodings,
    pub initiator_deposit: U256,
    pub initiator_deposit_token: Address,
    pub responder_deposit: U256,
    pub responder_deposit_token: Address,
    pub default_timeout: u64,
    pub initial_state: Vec<AbiValue>,
    pub outcome: OutcomeSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallParams {
    pub app_identity_hash: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallVirtualAppParams {
    pub initiator: Xpub,
    pub intermediary: Xpub,
    pub responder: Xpub,
    pub app_definition: Address,
    pub abi_encodings: AbiEncodings,
    pub initiator_deposit: U256,
    pub responder_deposit: U256,
    pub token: Address,
    pub default_timeout: u64,
    pub initial_state: Vec<AbiValue>,
}

impl InstallVirtualAppParams {
    /// The total locked in each direct channel. Deposits come off the wire,
    /// so the sum is checked rather than trusted to fit a uint256.
    pub fn capital(&self) -> Result<U256, ProtocolError> {
        self.initiator_deposit
            .checked_add(self.responder_deposit)
            .ok_or(ProtocolError::DepositOverflow)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TakeActionParams {
    pub app_identity_hash: Hash,
    pub action: Vec<AbiValue>,
    /// The full post-action state. Both parties carry it explicitly rather
    /// than evaluating the app's transition function, which lives on chain.
    pub new_state: Vec<AbiValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UninstallParams {
    pub app_identity_hash: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UninstallVirtualAppParams {
    pub initiator: Xpub,
    pub intermediary: Xpub,
    pub responder: Xpub,
    pub app_identity_hash: Hash,
    /// The agreed final state of the virtual app. The endpoints check it
    /// against their committed copy; the intermediary, which never sees the
    /// endpoint-to-endpoint updates, resolves the capital locks from it.
    pub final_state: Vec<AbiValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawParams {
    pub multisig_address: Address,
    pub recipient: Address,
    pub token: Address,
    pub amount: U256,
}

/// Parameters of the first message of a protocol instance, tagged by
/// protocol so a mismatched envelope fails to decode instead of being
/// misinterpreted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum ProtocolParams {
    Setup(SetupParams),
    Propose(ProposeParams),
    Install(InstallParams),
    InstallVirtualApp(InstallVirtualAppParams),
    TakeAction(TakeActionParams),
    Uninstall(UninstallParams),
    UninstallVirtualApp(UninstallVirtualAppParams),
    Withdraw(WithdrawParams),
}

impl ProtocolParams {
    pub fn protocol(&self) -> Protocol {
        match self {
            ProtocolParams::Setup(_) => Protocol::Setup,
            ProtocolParams::Propose(_) => Protocol::Propose,
            ProtocolParams::Install(_) => Protocol::Install,
            ProtocolParams::InstallVirtualApp(_) => Protocol::InstallVirtualApp,
            ProtocolParams::TakeAction(_) => Protocol::TakeAction,
            ProtocolParams::Uninstall(_) => Protocol::Uninstall,
            ProtocolParams::UninstallVirtualApp(_) => Protocol::UninstallVirtualApp,
            ProtocolParams::Withdraw(_) => Protocol::Withdraw,
        }
    }
}

#[derive(Debug)]
pub enum ProtocolError {
    /// A message arrived out of order for this instance.
    UnexpectedMessage { expected: i32, got: i32 },
    /// The first message of an instance carried no (or mismatched) params.
    MissingParams,
    /// The message did not carry the signatures its step requires.
    MissingSignatures,
    /// No committed channel at this multisig address.
    NoSuchChannel(Address),
    /// No direct channel between the two parties exists yet.
    NoChannelBetween(Box<(Xpub, Xpub)>),
    /// A setup for an address that already has a channel.
    ChannelExists(Address),
    /// No channel holds this app or proposal.
    AppNotFound(Hash),
    /// The virtual app protocols only support the fixed two-party outcome.
    UnsupportedOutcome,
    /// An endpoint's committed virtual app state disagrees with the final
    /// state the uninstall proposes.
    FinalStateMismatch(Hash),
    /// The message's claimed sender is not the counterparty of the channel
    /// it tries to mutate.
    SenderNotOwner(Xpub),
    /// The virtual app's deposits sum past 2^256-1.
    DepositOverflow,
    State(state::Error),
    Validation(sig::ValidationError),
    Keys(keys::Error),
    Encoding(abiencode::Error),
}

impl From<state::Error> for ProtocolError {
    fn from(e: state::Error) -> Self {
        Self::State(e)
    }
}

impl From<sig::ValidationError> for ProtocolError {
    fn from(e: sig::ValidationError) -> Self {
        Self::Validation(e)
    }
}

impl From<keys::Error> for ProtocolError {
    fn from(e: keys::Error) -> Self {
        Self::Keys(e)
    }
}

impl From<abiencode::Error> for ProtocolError {
    fn from(e: abiencode::Error) -> Self {
        Self::Encoding(e)
    }
}

impl core::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::UnexpectedMessage { expected, got } => {
                write!(f, "expected message seq {expected}, got {got}")
            }
            Self::MissingParams => write!(f, "first protocol message carried no params"),
            Self::MissingSignatures => write!(f, "message missing required signatures"),
            Self::NoSuchChannel(addr) => write!(f, "no channel at {addr:?}"),
            Self::NoChannelBetween(pair) => {
                write!(f, "no direct channel between {} and {}", pair.0, pair.1)
            }
            Self::ChannelExists(addr) => write!(f, "channel already exists at {addr:?}"),
            Self::AppNotFound(id) => write!(f, "no channel holds app {id:?}"),
            Self::UnsupportedOutcome => {
                write!(f, "virtual apps require a two-party fixed outcome")
            }
            Self::FinalStateMismatch(id) => {
                write!(f, "proposed final state of {id:?} disagrees with committed state")
            }
            Self::SenderNotOwner(xpub) => {
                write!(f, "sender {xpub} is not an owner of the target channel")
            }
            Self::DepositOverflow => write!(f, "virtual app deposits overflow a uint256"),
            Self::State(e) => write!(f, "{e}"),
            Self::Validation(e) => write!(f, "{e:?}"),
            Self::Keys(e) => write!(f, "{e:?}"),
            Self::Encoding(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Everything a machine needs to act: the committed ledgers, this node's key
/// material and the shared contract addresses.
///
/// `channels` holds direct (on-chain multisig) channels, `virtual_channels`
/// the synthetic ledgers carrying virtual apps between endpoints that share
/// no multisig.
#[derive(Debug)]
pub struct Context<'a> {
    pub network: &'a NetworkContext,
    pub channels: &'a mut BTreeMap<Address, StateChannel>,
    pub virtual_channels: &'a mut BTreeMap<Address, StateChannel>,
    pub wallet: &'a Wallet,
    pub key_cache: &'a mut KeyCache,
}

impl Context<'_> {
    pub fn our_xpub(&self) -> Xpub {
        self.wallet.xpub()
    }

    /// The committed direct channel whose owners are exactly `a` and `b`.
    pub fn direct_channel_between(
        &self,
        a: &Xpub,
        b: &Xpub,
    ) -> Result<&StateChannel, ProtocolError> {
        self.channels
            .values()
            .find(|c| c.owners().contains(a) && c.owners().contains(b))
            .ok_or_else(|| ProtocolError::NoChannelBetween(Box::new((*a, *b))))
    }

    /// The committed direct channel holding `id` as an app or proposal.
    pub fn channel_with_app(&self, id: Hash) -> Result<&StateChannel, ProtocolError> {
        self.channels
            .values()
            .find(|c| c.has_app(id) || c.has_proposal(id))
            .ok_or(ProtocolError::AppNotFound(id))
    }

    /// Like [`Context::channel_with_app`], but searching the virtual ledgers
    /// too. The flag reports which map the channel came from.
    pub fn any_channel_with_app(
        &self,
        id: Hash,
    ) -> Result<(&StateChannel, bool), ProtocolError> {
        if let Ok(channel) = self.channel_with_app(id) {
            return Ok((channel, false));
        }
        self.virtual_channels
            .values()
            .find(|c| c.has_app(id))
            .map(|c| (c, true))
            .ok_or(ProtocolError::AppNotFound(id))
    }
}

/// What a machine produced from one input: envelopes to send, channels to
/// persist, and either a follow-up state or completion (`next == None`).
#[derive(Debug)]
pub struct Step<M> {
    pub next: Option<M>,
    pub send: Vec<Envelope>,
    /// Multisig addresses whose committed snapshot changed in this step.
    pub touched: Vec<Address>,
}

impl<M> Step<M> {
    pub fn finished(send: Vec<Envelope>, touched: Vec<Address>) -> Self {
        Step {
            next: None,
            send,
            touched,
        }
    }

    pub fn waiting(next: M, send: Vec<Envelope>, touched: Vec<Address>) -> Self {
        Step {
            next: Some(next),
            send,
            touched,
        }
    }
}

/// The other owner of a two-party channel.
pub(crate) fn counterparty_of(channel: &StateChannel, our: &Xpub) -> Xpub {
    channel
        .owners()
        .iter()
        .copied()
        .find(|o| o != our)
        .unwrap_or(*our)
}

/// Resolve the counterparty of a committed two-party channel and require
/// the envelope's claimed `from` to be exactly that owner. Every signature
/// a responder checks is verified against the xpub returned here, not
/// against the wire's `from` field.
pub(crate) fn expect_sender(
    channel: &StateChannel,
    our: &Xpub,
    envelope: &Envelope,
) -> Result<Xpub, ProtocolError> {
    let counterparty = counterparty_of(channel, our);
    if envelope.from != counterparty {
        return Err(ProtocolError::SenderNotOwner(envelope.from));
    }
    Ok(counterparty)
}

pub(crate) fn expect_seq(envelope: &Envelope, expected: i32) -> Result<(), ProtocolError> {
    if envelope.seq != expected {
        return Err(ProtocolError::UnexpectedMessage {
            expected,
            got: envelope.seq,
        });
    }
    Ok(())
}

pub(crate) fn single_signature(envelope: &Envelope) -> Result<Signature, ProtocolError> {
    envelope
        .custom_data
        .single()
        .ok_or(ProtocolError::MissingSignatures)
}

/// Verify one signature over `digest` against the address `signer` derives
/// at `index`.
pub(crate) fn assert_signed_at_index(
    cache: &mut KeyCache,
    digest: Hash,
    signature: Signature,
    signer: &Xpub,
    index: u32,
) -> Result<(), ProtocolError> {
    let expected = cache.derive(signer, index)?;
    assert_signed_by(digest, signature, expected)?;
    Ok(())
}

/// Envelope constructor used by every machine.
pub(crate) fn reply(
    template: &Envelope,
    from: Xpub,
    to: Xpub,
    seq: i32,
    params: Option<ProtocolParams>,
    custom_data: CustomData,
) -> Envelope {
    Envelope {
        protocol: template.protocol,
        process_id: template.process_id,
        seq,
        from,
        to,
        params,
        custom_data,
    }
}

/// First envelope of a fresh instance.
pub(crate) fn opening(
    protocol: Protocol,
    process_id: ProcessId,
    from: Xpub,
    to: Xpub,
    params: ProtocolParams,
    custom_data: CustomData,
) -> Envelope {
    Envelope {
        protocol,
        process_id,
        seq: 1,
        from,
        to,
        params: Some(params),
        custom_data,
    }
}
