//! Multisig script construction and payee classification.
//!
//! Every account pays to a P2SH-wrapped bare multisig redeem script:
//! `OP_m <pk_1> ... <pk_n> OP_n OP_CHECKMULTISIG`, keys in the account's
//! keychain order.

use bitcoin::{
    hashes::Hash,
    opcodes::all::OP_CHECKMULTISIG,
    script::{Builder, Instruction, ScriptBuf},
    secp256k1::PublicKey,
    Address, Network, PubkeyHash, Script, ScriptHash,
};

use crate::{
    constants::MAX_MULTISIG_KEYS,
    error::{Error, Result},
};

/// Who a `scriptPubKey` pays to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payee {
    P2sh(ScriptHash),
    P2pkh(PubkeyHash),
    Unknown,
}

pub fn classify_script(script: &Script) -> Payee {
    let bytes = script.as_bytes();
    if script.is_p2sh() {
        if let Ok(hash) = ScriptHash::from_slice(&bytes[2..22]) {
            return Payee::P2sh(hash);
        }
    } else if script.is_p2pkh() {
        if let Ok(hash) = PubkeyHash::from_slice(&bytes[3..23]) {
            return Payee::P2pkh(hash);
        }
    }
    Payee::Unknown
}

/// Renders a payee as an address, if it has one.
pub fn payee_address(script: &Script, network: Network) -> Option<Address> {
    match classify_script(script) {
        Payee::Unknown => None,
        _ => Address::from_script(script, network).ok(),
    }
}

pub(crate) fn multisig_redeem_script(minsigs: u32, pubkeys: &[PublicKey]) -> Result<ScriptBuf> {
    check_policy(minsigs, pubkeys.len())?;

    let mut builder = Builder::new().push_int(i64::from(minsigs));
    for pubkey in pubkeys {
        builder = builder.push_key(&bitcoin::PublicKey::new(*pubkey));
    }
    Ok(builder
        .push_int(pubkeys.len() as i64)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script())
}

pub(crate) fn p2sh_script_pubkey(redeem_script: &Script) -> ScriptBuf {
    ScriptBuf::new_p2sh(&redeem_script.script_hash())
}

pub(crate) fn check_policy(minsigs: u32, keychains: usize) -> Result<()> {
    if minsigs < 1 || minsigs as usize > keychains || keychains > MAX_MULTISIG_KEYS {
        return Err(Error::InvalidPolicy { minsigs, keychains });
    }
    Ok(())
}

/// Public keys of a redeem script built by [`multisig_redeem_script`], in order.
pub(crate) fn redeem_script_pubkeys(redeem_script: &Script) -> Result<Vec<PublicKey>> {
    let mut pubkeys = Vec::new();
    for instruction in redeem_script.instructions() {
        let instruction = instruction
            .map_err(|e| Error::IntegrityViolation(format!("malformed redeem script: {e}")))?;
        if let Instruction::PushBytes(bytes) = instruction {
            if bytes.len() == 33 {
                pubkeys.push(PublicKey::from_slice(bytes.as_bytes())?);
            }
        }
    }
    Ok(pubkeys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};

    fn pubkeys(n: u8) -> Vec<PublicKey> {
        let secp = Secp256k1::new();
        (1..=n)
            .map(|i| SecretKey::from_slice(&[i; 32]).unwrap().public_key(&secp))
            .collect()
    }

    #[test]
    fn two_of_three_layout() {
        let keys = pubkeys(3);
        let redeem = multisig_redeem_script(2, &keys).unwrap();
        let bytes = redeem.as_bytes();

        // OP_2, three 33-byte pushes, OP_3, OP_CHECKMULTISIG
        assert_eq!(bytes.len(), 1 + 3 * 34 + 2);
        assert_eq!(bytes[0], 0x52);
        assert_eq!(bytes[bytes.len() - 2], 0x53);
        assert_eq!(bytes[bytes.len() - 1], 0xae);
        assert_eq!(redeem_script_pubkeys(&redeem).unwrap(), keys);
    }

    #[test]
    fn key_order_changes_script() {
        let keys = pubkeys(2);
        let reversed: Vec<_> = keys.iter().rev().cloned().collect();
        assert_ne!(
            multisig_redeem_script(1, &keys).unwrap(),
            multisig_redeem_script(1, &reversed).unwrap()
        );
    }

    #[test]
    fn policy_bounds() {
        let keys = pubkeys(3);
        assert!(matches!(
            multisig_redeem_script(0, &keys),
            Err(Error::InvalidPolicy { minsigs: 0, keychains: 3 })
        ));
        assert!(matches!(
            multisig_redeem_script(4, &keys),
            Err(Error::InvalidPolicy { minsigs: 4, keychains: 3 })
        ));
        assert!(check_policy(1, 16).is_err());
    }

    #[test]
    fn classify_payees() {
        let redeem = multisig_redeem_script(1, &pubkeys(1)).unwrap();
        let p2sh = p2sh_script_pubkey(&redeem);
        assert_eq!(classify_script(&p2sh), Payee::P2sh(redeem.script_hash()));
        assert!(payee_address(&p2sh, Network::Bitcoin)
            .unwrap()
            .to_string()
            .starts_with('3'));

        let pk = bitcoin::PublicKey::new(pubkeys(1)[0]);
        let p2pkh = ScriptBuf::new_p2pkh(&pk.pubkey_hash());
        assert_eq!(classify_script(&p2pkh), Payee::P2pkh(pk.pubkey_hash()));

        assert_eq!(classify_script(&redeem), Payee::Unknown);
        assert!(payee_address(&redeem, Network::Bitcoin).is_none());
    }
}
