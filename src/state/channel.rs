//! The channel ledger itself.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    free_balance::FreeBalance, AppInstance, AppInstanceProposal, Error,
};
use crate::abiencode::{
    encode,
    types::{Address, Hash, U256},
    AbiValue,
};
use crate::keys::{KeyCache, Xpub};
use crate::network::NetworkContext;

/// One direct off-chain relationship between participants, keyed by the
/// on-chain multisig address.
///
/// Mutations are pure: every mutator validates its preconditions against the
/// current value and returns a fresh `StateChannel`. The engine only
/// replaces its committed copy at a successful persistence boundary, so a
/// failed protocol step can simply drop the candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChannel {
    multisig_address: Address,
    /// Participant root identities, sorted ascending by their address at
    /// derivation index 0.
    multisig_owners: Vec<Xpub>,
    app_instances: BTreeMap<Hash, AppInstance>,
    proposed_app_instances: BTreeMap<Hash, AppInstanceProposal>,
    free_balance: FreeBalance,
    /// Monotonically increasing counters seeding signing-key derivation
    /// indices and channel nonces. Never reused, even across uninstalls.
    num_proposed_apps: u64,
    num_installed_apps: u64,
}

impl StateChannel {
    /// A fresh channel on a fresh multisig: no apps, no proposals, a zeroed
    /// free balance. The free balance occupies sequence number 0, so
    /// `num_installed_apps` starts at 1.
    pub fn setup(
        _network: &NetworkContext,
        multisig_address: Address,
        owners: &[Xpub],
        cache: &mut KeyCache,
    ) -> Result<Self, Error> {
        let multisig_owners = cache.sorted_owners(owners)?;
        let participants = cache.sorted_addresses(&multisig_owners, 0)?;
        Ok(StateChannel {
            multisig_address,
            multisig_owners,
            app_instances: BTreeMap::new(),
            proposed_app_instances: BTreeMap::new(),
            free_balance: FreeBalance::new(participants),
            num_proposed_apps: 0,
            num_installed_apps: 1,
        })
    }

    pub fn multisig_address(&self) -> Address {
        self.multisig_address
    }

    pub fn owners(&self) -> &[Xpub] {
        &self.multisig_owners
    }

    pub fn free_balance(&self) -> &FreeBalance {
        &self.free_balance
    }

    pub fn num_proposed_apps(&self) -> u64 {
        self.num_proposed_apps
    }

    pub fn num_installed_apps(&self) -> u64 {
        self.num_installed_apps
    }

    pub fn apps(&self) -> impl Iterator<Item = &AppInstance> {
        self.app_instances.values()
    }

    pub fn proposals(&self) -> impl Iterator<Item = &AppInstanceProposal> {
        self.proposed_app_instances.values()
    }

    pub fn app(&self, identity_hash: Hash) -> Result<&AppInstance, Error> {
        self.app_instances
            .get(&identity_hash)
            .ok_or(Error::NoSuchApp(identity_hash))
    }

    pub fn has_app(&self, identity_hash: Hash) -> bool {
        self.app_instances.contains_key(&identity_hash)
    }

    pub fn proposal(&self, identity_hash: Hash) -> Result<&AppInstanceProposal, Error> {
        self.proposed_app_instances
            .get(&identity_hash)
            .ok_or(Error::NoSuchProposal(identity_hash))
    }

    pub fn has_proposal(&self, identity_hash: Hash) -> bool {
        self.proposed_app_instances.contains_key(&identity_hash)
    }

    pub fn get_free_balance_for(&self, token: Address, beneficiary: Address) -> U256 {
        self.free_balance.balance_of(token, beneficiary)
    }

    /// Derive the per-app signing keys of all owners at `seq_no`, sorted
    /// ascending.
    pub fn signing_keys_for(&self, seq_no: u64, cache: &mut KeyCache) -> Result<Vec<Address>, Error> {
        Ok(cache.sorted_addresses(&self.multisig_owners, seq_no as u32)?)
    }

    /// The root address of one owner (derivation index 0).
    pub fn root_address_of(&self, owner: &Xpub, cache: &mut KeyCache) -> Result<Address, Error> {
        Ok(cache.derive(owner, 0)?)
    }

    /// The sequence number the next proposal must carry.
    pub fn next_app_seq_no(&self) -> u64 {
        self.num_proposed_apps + 1
    }

    /// Credit a deposit to the free balance. Funding itself (the on-chain
    /// transfer into the multisig) happens outside this crate; this mirrors
    /// its effect into the ledger.
    pub fn credit(
        &self,
        token: Address,
        beneficiary: Address,
        amount: U256,
    ) -> Result<StateChannel, Error> {
        let mut next = self.clone();
        next.free_balance.credit(token, beneficiary, amount)?;
        next.free_balance.bump_version();
        Ok(next)
    }

    /// Record a proposal. Fails unless its sequence number is exactly
    /// `num_proposed_apps + 1` and the identity hash is new.
    pub fn add_proposal(&self, proposal: AppInstanceProposal) -> Result<StateChannel, Error> {
        if proposal.app_seq_no != self.num_proposed_apps + 1 {
            return Err(Error::WrongAppSeqNo {
                expected: self.num_proposed_apps + 1,
                got: proposal.app_seq_no,
            });
        }
        if self.proposed_app_instances.contains_key(&proposal.identity_hash) {
            return Err(Error::ProposalExists(proposal.identity_hash));
        }
        let mut next = self.clone();
        next.num_proposed_apps += 1;
        next.proposed_app_instances
            .insert(proposal.identity_hash, proposal);
        Ok(next)
    }

    pub fn remove_proposal(&self, identity_hash: Hash) -> Result<StateChannel, Error> {
        if !self.proposed_app_instances.contains_key(&identity_hash) {
            return Err(Error::NoSuchProposal(identity_hash));
        }
        let mut next = self.clone();
        next.proposed_app_instances.remove(&identity_hash);
        Ok(next)
    }

    /// Move a proposal into the installed set.
    ///
    /// Builds the app instance from the stored proposal (signing keys at the
    /// proposal's sequence number, deposits symmetrized to root addresses),
    /// deducts both deposits from the free balance, and removes the
    /// proposal. Fails without mutation if the proposal is unknown, the app
    /// already exists, the initial state does not encode, or either deposit
    /// would drive a balance negative; a second install of the same
    /// identity hash can therefore never double-spend.
    pub fn install_app(
        &self,
        identity_hash: Hash,
        cache: &mut KeyCache,
    ) -> Result<(StateChannel, AppInstance), Error> {
        let proposal = self.proposal(identity_hash)?.clone();
        if self.app_instances.contains_key(&identity_hash) {
            return Err(Error::AppExists(identity_hash));
        }

        let signing_keys = self.signing_keys_for(proposal.app_seq_no, cache)?;
        encode(&proposal.abi_encodings.state, &proposal.initial_state)?;

        let app = AppInstance {
            multisig_address: self.multisig_address,
            signing_keys,
            app_definition: proposal.app_definition,
            abi_encodings: proposal.abi_encodings.clone(),
            default_timeout: proposal.default_timeout,
            app_seq_no: proposal.app_seq_no,
            latest_state: proposal.initial_state.clone(),
            latest_version_number: 0,
            latest_timeout: proposal.default_timeout,
            outcome: proposal.outcome.clone(),
        };

        let proposer = cache.derive(&proposal.proposed_by, 0)?;
        let counterparty = cache.derive(&proposal.proposed_to, 0)?;

        let mut next = self.clone();
        next.free_balance.deduct(
            proposal.initiator_deposit_token,
            proposer,
            proposal.initiator_deposit,
        )?;
        next.free_balance.deduct(
            proposal.responder_deposit_token,
            counterparty,
            proposal.responder_deposit,
        )?;
        next.free_balance.bump_version();
        next.proposed_app_instances.remove(&identity_hash);
        next.app_instances.insert(identity_hash, app.clone());
        next.num_installed_apps += 1;

        debug!(
            multisig = ?self.multisig_address,
            app = ?identity_hash,
            seq = proposal.app_seq_no,
            "installed app"
        );
        Ok((next, app))
    }

    /// Install an already-built app instance without a stored proposal,
    /// deducting `decrements` from the free balance. Used for the
    /// intermediary's capital-lock agreements of the virtual app protocols,
    /// where both sides construct the instance deterministically instead of
    /// exchanging a proposal first.
    pub fn install_prepared(
        &self,
        app: AppInstance,
        decrements: &[(Address, Address, U256)],
    ) -> Result<StateChannel, Error> {
        if app.app_seq_no != self.num_proposed_apps + 1 {
            return Err(Error::WrongAppSeqNo {
                expected: self.num_proposed_apps + 1,
                got: app.app_seq_no,
            });
        }
        let identity_hash = app.identity_hash();
        if self.app_instances.contains_key(&identity_hash) {
            return Err(Error::AppExists(identity_hash));
        }

        let mut next = self.clone();
        for (token, who, amount) in decrements {
            next.free_balance.deduct(*token, *who, *amount)?;
        }
        next.free_balance.bump_version();
        next.app_instances.insert(identity_hash, app);
        next.num_proposed_apps += 1;
        next.num_installed_apps += 1;
        Ok(next)
    }

    /// Replace an app's state wholesale, bumping its version by exactly 1.
    pub fn set_app_state(
        &self,
        identity_hash: Hash,
        new_state: Vec<AbiValue>,
        timeout: Option<u64>,
    ) -> Result<StateChannel, Error> {
        let app = self.app(identity_hash)?;
        let updated = app.set_state(new_state, timeout)?;
        let mut next = self.clone();
        next.app_instances.insert(identity_hash, updated);
        Ok(next)
    }

    /// Remove an app, crediting `increments` (usually its computed outcome)
    /// to the free balance. The app's sequence number is never reused and
    /// `num_installed_apps` never decreases.
    pub fn uninstall_app(
        &self,
        identity_hash: Hash,
        increments: &BTreeMap<Address, Vec<(Address, U256)>>,
    ) -> Result<StateChannel, Error> {
        if !self.app_instances.contains_key(&identity_hash) {
            return Err(Error::NoSuchApp(identity_hash));
        }
        let mut next = self.clone();
        next.app_instances.remove(&identity_hash);
        for (token, transfers) in increments {
            for (to, amount) in transfers {
                next.free_balance.credit(*token, *to, *amount)?;
            }
        }
        next.free_balance.bump_version();
        debug!(
            multisig = ?self.multisig_address,
            app = ?identity_hash,
            "uninstalled app"
        );
        Ok(next)
    }

    /// Deduct a withdrawal from the free balance.
    pub fn withdraw(
        &self,
        token: Address,
        who: Address,
        amount: U256,
    ) -> Result<StateChannel, Error> {
        let mut next = self.clone();
        next.free_balance.deduct(token, who, amount)?;
        next.free_balance.bump_version();
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;
    use crate::abiencode::{AbiEncodings, AbiType};
    use crate::state::{compute_outcome, identity_hash, OutcomeSpec};

    const ETH: Address = Address([0u8; 20]);

    fn owners(rng: &mut StdRng) -> Vec<Xpub> {
        (0..2)
            .map(|_| Xpub::from_private(&rng.gen(), rng.gen()).unwrap())
            .collect()
    }

    fn funded_channel(rng: &mut StdRng, cache: &mut KeyCache) -> StateChannel {
        let network = NetworkContext::for_testing();
        let owners = owners(rng);
        let channel =
            StateChannel::setup(&network, Address([0xcc; 20]), &owners, cache).unwrap();
        let roots = channel.free_balance().participants().to_vec();
        channel
            .credit(ETH, roots[0], U256::from(10))
            .unwrap()
            .credit(ETH, roots[1], U256::from(10))
            .unwrap()
    }

    fn proposal_for(channel: &StateChannel, cache: &mut KeyCache) -> AppInstanceProposal {
        let seq = channel.next_app_seq_no();
        let keys = channel.signing_keys_for(seq, cache).unwrap();
        let app_definition = Address([0xdd; 20]);
        let roots = channel.free_balance().participants();
        AppInstanceProposal {
            identity_hash: identity_hash(&keys, app_definition, 100, seq),
            app_seq_no: seq,
            proposed_by: channel.owners()[0],
            proposed_to: channel.owners()[1],
            app_definition,
            abi_encodings: AbiEncodings {
                state: vec![AbiType::Uint256],
                action: None,
            },
            initiator_deposit: U256::from(3),
            initiator_deposit_token: ETH,
            responder_deposit: U256::from(2),
            responder_deposit_token: ETH,
            default_timeout: 100,
            initial_state: vec![AbiValue::Uint(U256::from(2))],
            outcome: OutcomeSpec::TwoPartyFixedOutcome {
                token: ETH,
                amount: U256::from(5),
                beneficiaries: [roots[0], roots[1]],
            },
            intermediary: None,
        }
    }

    #[test]
    fn setup_creates_zeroed_free_balance() {
        let mut rng = StdRng::seed_from_u64(20);
        let mut cache = KeyCache::new();
        let network = NetworkContext::for_testing();
        let owners = owners(&mut rng);

        let channel =
            StateChannel::setup(&network, Address([0xcc; 20]), &owners, &mut cache).unwrap();
        assert_eq!(channel.num_installed_apps(), 1);
        assert_eq!(channel.num_proposed_apps(), 0);
        assert_eq!(channel.apps().count(), 0);
        for p in channel.free_balance().participants() {
            assert_eq!(channel.get_free_balance_for(ETH, *p), U256::zero());
        }
        // Owners are stored sorted by root address.
        let roots = channel.free_balance().participants();
        assert!(roots[0] < roots[1]);
    }

    #[test]
    fn add_proposal_enforces_sequence_numbers() {
        let mut rng = StdRng::seed_from_u64(21);
        let mut cache = KeyCache::new();
        let channel = funded_channel(&mut rng, &mut cache);

        let mut proposal = proposal_for(&channel, &mut cache);
        proposal.app_seq_no = 5;
        let err = channel.add_proposal(proposal).unwrap_err();
        assert!(matches!(err, Error::WrongAppSeqNo { expected: 1, got: 5 }));

        let proposal = proposal_for(&channel, &mut cache);
        let next = channel.add_proposal(proposal.clone()).unwrap();
        assert_eq!(next.num_proposed_apps(), 1);
        // No in-place mutation of the original.
        assert_eq!(channel.num_proposed_apps(), 0);

        let err = next.add_proposal(proposal).unwrap_err();
        assert!(matches!(err, Error::WrongAppSeqNo { .. }));
    }

    #[test]
    fn install_moves_funds_and_uninstall_restores_them() {
        let mut rng = StdRng::seed_from_u64(22);
        let mut cache = KeyCache::new();
        let channel = funded_channel(&mut rng, &mut cache);
        let roots = channel.free_balance().participants().to_vec();

        let proposal = proposal_for(&channel, &mut cache);
        let id = proposal.identity_hash;
        let proposed = channel.add_proposal(proposal).unwrap();
        let (installed, app) = proposed.install_app(id, &mut cache).unwrap();

        assert_eq!(installed.get_free_balance_for(ETH, roots[0]), U256::from(7));
        assert_eq!(installed.get_free_balance_for(ETH, roots[1]), U256::from(8));
        assert!(installed.has_app(id));
        assert!(!installed.has_proposal(id));

        // Outcome "split" sends the deposits back as (3, 2) overall.
        let final_app = installed.app(id).unwrap();
        let outcome = compute_outcome(final_app).unwrap();
        let restored = installed.uninstall_app(id, &outcome).unwrap();

        // Split of 5 is (3, 2) with the remainder on the first beneficiary.
        assert_eq!(restored.get_free_balance_for(ETH, roots[0]), U256::from(10));
        assert_eq!(restored.get_free_balance_for(ETH, roots[1]), U256::from(10));
        assert!(!restored.has_app(id));
        // The sequence counter does not go backwards.
        assert_eq!(restored.num_installed_apps(), installed.num_installed_apps());
        assert_eq!(app.app_seq_no, 1);
    }

    #[test]
    fn double_install_fails_without_double_spending() {
        let mut rng = StdRng::seed_from_u64(23);
        let mut cache = KeyCache::new();
        let channel = funded_channel(&mut rng, &mut cache);
        let roots = channel.free_balance().participants().to_vec();

        let proposal = proposal_for(&channel, &mut cache);
        let id = proposal.identity_hash;
        let proposed = channel.add_proposal(proposal).unwrap();
        let (installed, _) = proposed.install_app(id, &mut cache).unwrap();

        // The proposal is consumed, a second install cannot succeed.
        let err = installed.install_app(id, &mut cache).unwrap_err();
        assert!(matches!(err, Error::NoSuchProposal(_)));
        assert_eq!(installed.get_free_balance_for(ETH, roots[0]), U256::from(7));
    }

    #[test]
    fn install_with_insufficient_funds_rejects() {
        let mut rng = StdRng::seed_from_u64(24);
        let mut cache = KeyCache::new();
        let channel = funded_channel(&mut rng, &mut cache);

        let mut proposal = proposal_for(&channel, &mut cache);
        proposal.initiator_deposit = U256::from(100);
        let id = proposal.identity_hash;
        let proposed = channel.add_proposal(proposal).unwrap();
        let err = proposed.install_app(id, &mut cache).unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds { .. }));
        // The failed install left the proposal in place.
        assert!(proposed.has_proposal(id));
    }

    #[test]
    fn withdraw_deducts_and_bumps_free_balance_version() {
        let mut rng = StdRng::seed_from_u64(25);
        let mut cache = KeyCache::new();
        let channel = funded_channel(&mut rng, &mut cache);
        let roots = channel.free_balance().participants().to_vec();

        let before = channel.free_balance().version();
        let after = channel.withdraw(ETH, roots[0], U256::from(4)).unwrap();
        assert_eq!(after.get_free_balance_for(ETH, roots[0]), U256::from(6));
        assert_eq!(after.free_balance().version(), before + 1);

        let err = after.withdraw(ETH, roots[0], U256::from(7)).unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds { .. }));
    }

    #[test]
    fn proposal_and_install_seq_numbers_never_diverge() {
        // Regression test: the sequence number is assigned once, at proposal
        // time; install reads it from the stored proposal. Drive several
        // proposal/install rounds and check the invariant each time.
        let mut rng = StdRng::seed_from_u64(26);
        let mut cache = KeyCache::new();
        let mut channel = funded_channel(&mut rng, &mut cache);

        for round in 1..=3u64 {
            let mut proposal = proposal_for(&channel, &mut cache);
            proposal.initiator_deposit = U256::from(1);
            proposal.responder_deposit = U256::from(1);
            let id = proposal.identity_hash;
            assert_eq!(proposal.app_seq_no, round);

            channel = channel.add_proposal(proposal).unwrap();
            let (next, app) = channel.install_app(id, &mut cache).unwrap();
            assert_eq!(app.app_seq_no, round);
            assert_eq!(next.num_proposed_apps(), round);
            channel = next;
        }
    }
}
