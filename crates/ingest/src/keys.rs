//! Ledger key derivation and canonical encoding.
//!
//! Dedup and compaction key everything by the XDR encoding of an entry's
//! [`LedgerKey`]. Two logically equal keys always encode to identical bytes,
//! so the encoding is used verbatim as a map key and never re-derived.

use base64::{engine::general_purpose::STANDARD, Engine};
use stellar_xdr::curr::{
    BytesM, ContractCodeEntry, ContractCodeEntryExt, ContractDataEntry, ExtensionPoint,
    LedgerEntry, LedgerEntryData, LedgerEntryExt, LedgerKey, LedgerKeyAccount,
    LedgerKeyClaimableBalance, LedgerKeyConfigSetting, LedgerKeyContractCode,
    LedgerKeyContractData, LedgerKeyData, LedgerKeyLiquidityPool, LedgerKeyOffer,
    LedgerKeyTrustLine, LedgerKeyTtl, Limits, ScVal, TtlEntry, WriteXdr,
};

use crate::{IngestError, Result};

/// Canonical byte encoding of a ledger key.
pub type KeyBytes = Vec<u8>;

/// Derive the ledger key identifying `entry`.
pub fn ledger_entry_key(entry: &LedgerEntry) -> LedgerKey {
    match &entry.data {
        LedgerEntryData::Account(a) => LedgerKey::Account(LedgerKeyAccount {
            account_id: a.account_id.clone(),
        }),
        LedgerEntryData::Trustline(t) => LedgerKey::Trustline(LedgerKeyTrustLine {
            account_id: t.account_id.clone(),
            asset: t.asset.clone(),
        }),
        LedgerEntryData::Offer(o) => LedgerKey::Offer(LedgerKeyOffer {
            seller_id: o.seller_id.clone(),
            offer_id: o.offer_id,
        }),
        LedgerEntryData::Data(d) => LedgerKey::Data(LedgerKeyData {
            account_id: d.account_id.clone(),
            data_name: d.data_name.clone(),
        }),
        LedgerEntryData::ClaimableBalance(cb) => {
            LedgerKey::ClaimableBalance(LedgerKeyClaimableBalance {
                balance_id: cb.balance_id.clone(),
            })
        }
        LedgerEntryData::LiquidityPool(lp) => LedgerKey::LiquidityPool(LedgerKeyLiquidityPool {
            liquidity_pool_id: lp.liquidity_pool_id.clone(),
        }),
        LedgerEntryData::ContractData(cd) => LedgerKey::ContractData(LedgerKeyContractData {
            contract: cd.contract.clone(),
            key: cd.key.clone(),
            durability: cd.durability,
        }),
        LedgerEntryData::ContractCode(cc) => LedgerKey::ContractCode(LedgerKeyContractCode {
            hash: cc.hash.clone(),
        }),
        LedgerEntryData::ConfigSetting(cs) => LedgerKey::ConfigSetting(LedgerKeyConfigSetting {
            config_setting_id: cs.discriminant(),
        }),
        LedgerEntryData::Ttl(t) => LedgerKey::Ttl(LedgerKeyTtl {
            key_hash: t.key_hash.clone(),
        }),
    }
}

/// Canonical encoding of `key`.
pub fn key_bytes(key: &LedgerKey) -> Result<KeyBytes> {
    Ok(key.to_xdr(Limits::none())?)
}

/// Canonical encoding of the key of `entry`.
pub fn entry_key_bytes(entry: &LedgerEntry) -> Result<KeyBytes> {
    key_bytes(&ledger_entry_key(entry))
}

/// Base64 rendering of an encoded key, as used in error messages.
pub fn key_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Build the placeholder entry reported as `pre` for an evicted key.
///
/// Eviction only ever removes Soroban entries, and the close meta lists
/// keys rather than values, so the entry carries the key fields and default
/// values everywhere else.
pub fn evicted_entry_from_key(key: &LedgerKey) -> Result<LedgerEntry> {
    let data = match key {
        LedgerKey::ContractData(k) => LedgerEntryData::ContractData(ContractDataEntry {
            ext: ExtensionPoint::V0,
            contract: k.contract.clone(),
            key: k.key.clone(),
            durability: k.durability,
            val: ScVal::Void,
        }),
        LedgerKey::ContractCode(k) => LedgerEntryData::ContractCode(ContractCodeEntry {
            ext: ContractCodeEntryExt::V0,
            hash: k.hash.clone(),
            code: BytesM::default(),
        }),
        LedgerKey::Ttl(k) => LedgerEntryData::Ttl(TtlEntry {
            key_hash: k.key_hash.clone(),
            live_until_ledger_seq: 0,
        }),
        other => {
            return Err(IngestError::InvalidChange(format!(
                "ledger key of type {:?} cannot be evicted",
                other.discriminant()
            )))
        }
    };
    Ok(LedgerEntry {
        last_modified_ledger_seq: 0,
        data,
        ext: LedgerEntryExt::V0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{account_entry, contract_data_entry, ttl_entry};
    use stellar_xdr::curr::{Hash, LedgerEntryType};

    #[test]
    fn test_entry_key_matches_account_id() {
        let entry = account_entry(1, 100);
        let LedgerKey::Account(key) = ledger_entry_key(&entry) else {
            panic!("expected account key");
        };
        let LedgerEntryData::Account(account) = &entry.data else {
            unreachable!()
        };
        assert_eq!(key.account_id, account.account_id);
    }

    #[test]
    fn test_key_bytes_ignore_entry_body() {
        // Same account, different balance and last-modified: same key.
        let mut a = account_entry(7, 100);
        let b = account_entry(7, 5_000);
        a.last_modified_ledger_seq = 99;
        assert_eq!(entry_key_bytes(&a).unwrap(), entry_key_bytes(&b).unwrap());
        assert_ne!(
            entry_key_bytes(&a).unwrap(),
            entry_key_bytes(&account_entry(8, 100)).unwrap()
        );
    }

    #[test]
    fn test_evicted_entry_keeps_key() {
        for entry in [contract_data_entry(3), ttl_entry(4, 10)] {
            let key = ledger_entry_key(&entry);
            let skeleton = evicted_entry_from_key(&key).unwrap();
            assert_eq!(ledger_entry_key(&skeleton), key);
        }

        let code = LedgerKey::ContractCode(LedgerKeyContractCode { hash: Hash([5; 32]) });
        let skeleton = evicted_entry_from_key(&code).unwrap();
        assert_eq!(skeleton.data.discriminant(), LedgerEntryType::ContractCode);
    }

    #[test]
    fn test_classic_keys_cannot_be_evicted() {
        let key = ledger_entry_key(&account_entry(1, 1));
        let err = evicted_entry_from_key(&key).unwrap_err();
        assert!(matches!(err, IngestError::InvalidChange(_)));
    }
}
