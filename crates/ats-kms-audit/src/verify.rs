//! Chain verification
//!
//! Walks the retained chain in ascending `seqNum`, checking hash
//! continuity, recomputing every chain hash, and dispatching signature
//! verification by signer kind. LAK entries are accepted only after their
//! delegation certificate verifies under the cached UAK public key, is
//! fresh at the entry's timestamp, and covers the entry's operation.
//!
//! Verification stops at the first break and reports its position; entries
//! before the break stay trustworthy, which is what makes the chain useful
//! for localizing tampering.

use ats_kms_core::records::{AuditEntry, AuditSignerKind};
use ats_kms_core::{b64url, ed25519, Result};
use ats_kms_store::{meta_keys, Store};

use crate::cert;
use crate::chain;
use crate::signer::signer_id_for;

/// Outcome of a chain verification run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainVerification {
    /// Whether every retained entry verified
    pub valid: bool,
    /// How many entries verified before the first break
    pub verified: u64,
    /// Human-readable descriptions of the breaks found
    pub errors: Vec<String>,
}

const SCAN_BATCH: usize = 256;

/// Verify the retained chain over a raw store
pub async fn verify_chain(store: &dyn Store, strict: bool) -> Result<ChainVerification> {
    let mut verified: u64 = 0;
    let mut expected_previous: Option<String> = None;
    let mut cursor: Option<u64> = None;

    loop {
        let from = match cursor {
            Some(seq) => seq,
            None => 0,
        };
        let batch = store.scan_audit(from, SCAN_BATCH).await?;
        if batch.is_empty() {
            break;
        }
        for entry in &batch {
            if let Err(message) = verify_entry(store, entry, &expected_previous, strict).await? {
                return Ok(ChainVerification {
                    valid: false,
                    verified,
                    errors: vec![message],
                });
            }
            expected_previous = Some(entry.chain_hash.clone());
            verified += 1;
        }
        cursor = Some(batch[batch.len() - 1].seq_num + 1);
    }

    Ok(ChainVerification {
        valid: true,
        verified,
        errors: Vec::new(),
    })
}

/// Check one entry; `Ok(Err(message))` is a verification break
async fn verify_entry(
    store: &dyn Store,
    entry: &AuditEntry,
    expected_previous: &Option<String>,
    strict: bool,
) -> Result<std::result::Result<(), String>> {
    let seq = entry.seq_num;

    // 1. Hash-chain continuity. The first retained entry is the anchor: at
    // seq 0 its previousHash must be the genesis value, after pruning it is
    // accepted as-is.
    match expected_previous {
        Some(expected) if &entry.previous_hash != expected => {
            return Ok(Err(format!(
                "Entry {seq}: previousHash does not match chainHash of entry {}",
                seq.saturating_sub(1)
            )));
        }
        None if seq == 0
            && entry.previous_hash != ats_kms_core::constants::GENESIS_PREVIOUS_HASH =>
        {
            return Ok(Err(
                "Entry 0: previousHash of the genesis entry must be all zeros".to_string(),
            ));
        }
        _ => {}
    }

    // 2. Recompute the chain hash over everything except sig/chainHash.
    let recomputed = chain::compute_chain_hash(entry)?;
    if recomputed != entry.chain_hash {
        return Ok(Err(format!("Entry {seq}: chainHash mismatch")));
    }

    // 3. Resolve the signing public key according to the signer kind.
    let public_key = match entry.signer {
        AuditSignerKind::Uak => {
            let user_id = match &entry.user_id {
                Some(user_id) => user_id.clone(),
                None => return Ok(Err(format!("Entry {seq}: UAK entry without userId"))),
            };
            match store.get_meta(&meta_keys::uak_pub(&user_id)).await? {
                Some(public_key) => public_key,
                None => {
                    return Ok(Err(format!(
                        "Entry {seq}: no cached UAK public key for {user_id}"
                    )))
                }
            }
        }
        AuditSignerKind::Lak => {
            let cert = match &entry.cert {
                Some(cert) => cert,
                None => {
                    return Ok(Err(format!(
                        "Entry {seq}: LAK entry missing its delegation cert"
                    )))
                }
            };
            let user_id = match &entry.user_id {
                Some(user_id) => user_id.clone(),
                None => return Ok(Err(format!("Entry {seq}: LAK entry without userId"))),
            };
            let uak_public = match store.get_meta(&meta_keys::uak_pub(&user_id)).await? {
                Some(public_key) => public_key,
                None => {
                    return Ok(Err(format!(
                        "Entry {seq}: no cached UAK public key for {user_id}"
                    )))
                }
            };
            match cert::validate(cert, &uak_public, entry.timestamp, &entry.op) {
                Ok(delegate) => delegate,
                Err(rejection) => return Ok(Err(format!("Entry {seq}: {rejection}"))),
            }
        }
        AuditSignerKind::Kiak => {
            let inline_or_stored = match &entry.cert {
                Some(cert) => Some(cert.clone()),
                None => match store.get_meta(meta_keys::KIAK_CERT).await? {
                    Some(raw) => serde_json::from_slice(&raw).ok(),
                    None => None,
                },
            };
            match inline_or_stored {
                Some(cert) => {
                    let issuer = store
                        .get_meta(meta_keys::KIAK_CERT_ISSUER)
                        .await?
                        .and_then(|raw| String::from_utf8(raw).ok());
                    let uak_public = match issuer {
                        Some(user_id) => store.get_meta(&meta_keys::uak_pub(&user_id)).await?,
                        None => None,
                    };
                    match uak_public {
                        Some(uak_public) => {
                            // Pre-enrollment system entries legitimately
                            // predate the cert's notBefore; clamp for them.
                            let at = entry.timestamp.max(cert.not_before);
                            match cert::validate(&cert, &uak_public, at, &entry.op) {
                                Ok(delegate) => delegate,
                                Err(rejection) => {
                                    return Ok(Err(format!("Entry {seq}: {rejection}")))
                                }
                            }
                        }
                        None if strict => {
                            return Ok(Err(format!(
                                "Entry {seq}: KIAK cert issuer key unavailable"
                            )))
                        }
                        None => match store
                            .get_meta(&meta_keys::audit_pub(&entry.signer_id))
                            .await?
                        {
                            Some(public_key) => public_key,
                            None => {
                                return Ok(Err(format!(
                                    "Entry {seq}: unknown KIAK signer {}",
                                    entry.signer_id
                                )))
                            }
                        },
                    }
                }
                None if strict => {
                    return Ok(Err(format!(
                        "Entry {seq}: KIAK entry without a delegation cert"
                    )))
                }
                None => match store
                    .get_meta(&meta_keys::audit_pub(&entry.signer_id))
                    .await?
                {
                    Some(public_key) => public_key,
                    None => {
                        return Ok(Err(format!(
                            "Entry {seq}: unknown KIAK signer {}",
                            entry.signer_id
                        )))
                    }
                },
            }
        }
    };

    // 4. The signerId must be the hash of the resolved key.
    if signer_id_for(&public_key) != entry.signer_id {
        return Ok(Err(format!(
            "Entry {seq}: signerId does not match the resolved public key"
        )));
    }

    // 5. Finally, the signature over the raw chain-hash digest.
    let digest = chain::chain_hash_digest(&entry.chain_hash)?;
    let signature = match b64url::decode(&entry.sig) {
        Ok(signature) => signature,
        Err(_) => return Ok(Err(format!("Entry {seq}: signature is not base64url"))),
    };
    match ed25519::verify(&public_key, &digest, &signature) {
        Ok(true) => Ok(Ok(())),
        _ => Ok(Err(format!("Entry {seq}: Invalid signature"))),
    }
}
