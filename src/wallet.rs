//! Key management, coin selection and transaction signing.
//!
//! A wallet is a keyring plus a view of the chain. It never owns the
//! blockchain; everything it needs is expressed by the [`ChainAccess`]
//! capability set, so a wallet can be pointed at any chain instance.

use crate::blockchain::chain::Blockchain;
use crate::blockchain::transaction::{Transaction, TransactionInput, TransactionOutput};
use crate::blockchain::utxo::{OutPoint, UtxoEntry};
use crate::config::NetworkType;
use crate::crypto::keys::{address_to_pubkey_hash, KeyPair, PrivateKey};
use crate::error::{BlockchainError, Result};

/// Default transaction fee in satoshis (0.0001 coin).
pub const DEFAULT_FEE: i64 = 10_000;

/// The chain capabilities a wallet needs: balance queries, UTXO lookups and
/// mempool submission.
pub trait ChainAccess {
    fn balance_of(&self, pubkey_script: &[u8]) -> i64;
    fn utxos_for(&self, pubkey_script: &[u8]) -> Vec<(OutPoint, UtxoEntry)>;
    fn utxo(&self, outpoint: &OutPoint) -> Option<UtxoEntry>;
    fn submit_transaction(&mut self, tx: Transaction) -> bool;
}

impl ChainAccess for Blockchain {
    fn balance_of(&self, pubkey_script: &[u8]) -> i64 {
        self.utxo_set().balance(pubkey_script)
    }

    fn utxos_for(&self, pubkey_script: &[u8]) -> Vec<(OutPoint, UtxoEntry)> {
        self.utxo_set().utxos_for(pubkey_script)
    }

    fn utxo(&self, outpoint: &OutPoint) -> Option<UtxoEntry> {
        self.utxo_set().get(outpoint).cloned()
    }

    fn submit_transaction(&mut self, tx: Transaction) -> bool {
        Blockchain::submit_transaction(self, tx)
    }
}

/// A named keyring that can build and sign P2PKH transactions.
#[derive(Debug, Clone)]
pub struct Wallet {
    name: String,
    network: NetworkType,
    /// Insertion order matters: change returns to the first address.
    keypairs: Vec<KeyPair>,
}

impl Wallet {
    pub fn new(name: impl Into<String>) -> Self {
        Wallet::with_network(name, NetworkType::Mainnet)
    }

    pub fn with_network(name: impl Into<String>, network: NetworkType) -> Self {
        Wallet {
            name: name.into(),
            network,
            keypairs: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // ------------------------------------------------------------------
    // Key management
    // ------------------------------------------------------------------

    /// Generate a fresh key pair and return its address.
    pub fn generate_address(&mut self) -> String {
        let pair = KeyPair::generate(self.network);
        let address = pair.address.clone();
        self.keypairs.push(pair);
        address
    }

    pub fn addresses(&self) -> Vec<String> {
        self.keypairs.iter().map(|kp| kp.address.clone()).collect()
    }

    pub fn has_address(&self, address: &str) -> bool {
        self.keypairs.iter().any(|kp| kp.address == address)
    }

    pub fn keypair(&self, address: &str) -> Option<&KeyPair> {
        self.keypairs.iter().find(|kp| kp.address == address)
    }

    /// Import a WIF private key; returns the derived address.
    pub fn import_private_key(&mut self, wif: &str) -> Result<String> {
        let (private_key, _compressed, network) = PrivateKey::from_wif(wif)?;
        let pair = KeyPair::from_private(private_key, network);
        let address = pair.address.clone();
        if !self.has_address(&address) {
            self.keypairs.push(pair);
        }
        Ok(address)
    }

    /// Export an address's private key as compressed-WIF.
    pub fn export_private_key(&self, address: &str) -> Result<String> {
        let pair = self.keypair(address).ok_or_else(|| {
            BlockchainError::Wallet(format!("address {address} not in wallet '{}'", self.name))
        })?;
        Ok(pair.private_key.to_wif(true, self.network))
    }

    // ------------------------------------------------------------------
    // Balance
    // ------------------------------------------------------------------

    /// Total value of all UTXOs locked by this wallet's keys.
    pub fn balance(&self, chain: &impl ChainAccess) -> i64 {
        self.keypairs
            .iter()
            .map(|kp| chain.balance_of(&kp.pubkey_script()))
            .sum()
    }

    /// Every spendable output across the wallet's addresses.
    pub fn utxos(&self, chain: &impl ChainAccess) -> Vec<(OutPoint, UtxoEntry)> {
        self.keypairs
            .iter()
            .flat_map(|kp| chain.utxos_for(&kp.pubkey_script()))
            .collect()
    }

    // ------------------------------------------------------------------
    // Coin selection and transaction construction
    // ------------------------------------------------------------------

    /// Ascending-by-value greedy selection: smallest UTXOs first until the
    /// target is covered, consolidating dust over time.
    fn select_coins(
        &self,
        chain: &impl ChainAccess,
        amount: i64,
        fee: i64,
    ) -> Result<(Vec<(OutPoint, UtxoEntry)>, i64)> {
        let target = amount + fee;
        let mut candidates = self.utxos(chain);
        candidates.sort_by_key(|(_, entry)| entry.value);

        let mut selected = Vec::new();
        let mut total = 0i64;
        for (outpoint, entry) in candidates {
            total += entry.value;
            selected.push((outpoint, entry));
            if total >= target {
                return Ok((selected, total));
            }
        }

        Err(BlockchainError::InsufficientFunds {
            needed: target,
            available: total,
        })
    }

    /// Build an unsigned transaction paying `amount` to `to_address`, with
    /// change (if any) returning to the wallet's first address.
    pub fn create_transaction(
        &self,
        chain: &impl ChainAccess,
        to_address: &str,
        amount: i64,
        fee: i64,
    ) -> Result<Transaction> {
        let first = self.keypairs.first().ok_or_else(|| {
            BlockchainError::Wallet(format!("wallet '{}' has no addresses", self.name))
        })?;

        let (selected, total_input) = self.select_coins(chain, amount, fee)?;

        let inputs: Vec<TransactionInput> = selected
            .iter()
            .map(|(outpoint, _)| TransactionInput::new(outpoint.txid, outpoint.index))
            .collect();

        let recipient_script = address_to_pubkey_hash(to_address)?;
        let mut outputs = vec![TransactionOutput::new(amount, recipient_script)];

        let change = total_input - amount - fee;
        if change > 0 {
            outputs.push(TransactionOutput::new(change, first.pubkey_script()));
        }

        Ok(Transaction::new(inputs, outputs))
    }

    // ------------------------------------------------------------------
    // Signing
    // ------------------------------------------------------------------

    /// Sign every input with its owning key, matching `hash160(pubkey)`
    /// against the consumed output's locking script.
    ///
    /// All signatures commit to the transaction with empty signature
    /// scripts, so the digest is independent of signing order.
    pub fn sign_transaction(&self, chain: &impl ChainAccess, tx: &mut Transaction) -> Result<()> {
        let mut unsigned = tx.clone();
        for input in &mut unsigned.inputs {
            input.signature_script.clear();
        }
        let message = unsigned.serialize();

        for input in &mut tx.inputs {
            if input.is_coinbase() {
                continue;
            }
            let outpoint = input.outpoint();
            let entry = chain
                .utxo(&outpoint)
                .ok_or_else(|| BlockchainError::UtxoNotFound {
                    outpoint: outpoint.to_string(),
                })?;

            let pair = self
                .keypairs
                .iter()
                .find(|kp| kp.pubkey_script() == entry.pubkey_script)
                .ok_or_else(|| {
                    BlockchainError::Wallet(format!(
                        "no key in wallet '{}' owns {outpoint}",
                        self.name
                    ))
                })?;

            let signature = pair.private_key.sign(&message);
            let script = format!(
                "{} {}",
                hex::encode(signature),
                hex::encode(pair.public_key.serialize_compressed())
            );
            input.signature_script = script.into_bytes();
        }
        Ok(())
    }

    /// Create, sign and submit a payment in one step.
    pub fn send(
        &self,
        chain: &mut impl ChainAccess,
        to_address: &str,
        amount: i64,
        fee: i64,
    ) -> Result<Transaction> {
        let mut tx = self.create_transaction(chain, to_address, amount, fee)?;
        self.sign_transaction(chain, &mut tx)?;

        if !chain.submit_transaction(tx.clone()) {
            return Err(BlockchainError::Wallet(format!(
                "transaction {} rejected by the mempool",
                tx.txid().short()
            )));
        }
        log::info!(
            "wallet '{}' sent {amount} satoshis to {to_address} (txid {})",
            self.name,
            tx.txid().short()
        );
        Ok(tx)
    }
}
