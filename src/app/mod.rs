//! App module - Commands for the Aion signing application
//!
//! Builds the application's command APDUs and interprets its responses:
//! - Public key and address lookup for an HD account offset
//! - Payload signing
//! - Application configuration query

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use thiserror::Error;

use crate::exchange::{ExchangeError, Session};
use crate::protocol::to_hex;

/// Class byte of every Aion command
pub const CLA: u8 = 0xe0;

pub const INS_GET_PUBLIC_KEY: u8 = 0x02;
pub const INS_SIGN: u8 = 0x04;
pub const INS_GET_APP_CONFIGURATION: u8 = 0x06;

/// Hardened `44'/425'/0'/0'` prefix of every account path
pub const BIP44_PREFIX: [u8; 16] = [
    0x80, 0x00, 0x00, 0x2c, 0x80, 0x00, 0x01, 0xa9, 0x80, 0x00, 0x00, 0x00, 0x80, 0x00, 0x00, 0x00,
];

/// Largest account offset accepted by the application
pub const MAX_OFFSET: u32 = 0x0fff_ffff;

pub const BIP32_PATH_SIZE: usize = 20;

const HARDENED: u32 = 0x8000_0000;

/// Public key and address are each this long
pub const KEY_SIZE: usize = 32;

/// Longest payload that still fits the one-byte data length
pub const MAX_SIGN_PAYLOAD: usize = u8::MAX as usize - BIP32_PATH_SIZE - 1;

/// Application errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Offset {0:#x} exceeds maximum {max:#x}", max = MAX_OFFSET)]
    InvalidOffset(u32),

    #[error("Payload of {0} bytes exceeds maximum {max}", max = MAX_SIGN_PAYLOAD)]
    PayloadTooLarge(usize),

    #[error("Unexpected response length: {actual} bytes (expected {expected})")]
    InvalidResponseLength { expected: usize, actual: usize },

    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

pub type AppResult<T> = Result<T, AppError>;

/// Public key and derived address of one account
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyAddress {
    pub offset: u32,
    #[serde(serialize_with = "serialize_hex")]
    pub public_key: [u8; KEY_SIZE],
    #[serde(serialize_with = "serialize_hex")]
    pub address: [u8; KEY_SIZE],
}

fn serialize_hex<S>(bytes: &[u8; KEY_SIZE], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&to_hex(bytes))
}

impl std::fmt::Display for KeyAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "#{} address 0x{} public key 0x{}",
            self.offset,
            to_hex(&self.address),
            to_hex(&self.public_key)
        )
    }
}

/// Full account path for `offset`, every level hardened
pub fn bip32_path(offset: u32) -> AppResult<[u8; BIP32_PATH_SIZE]> {
    if offset > MAX_OFFSET {
        return Err(AppError::InvalidOffset(offset));
    }

    let mut path = [0u8; BIP32_PATH_SIZE];
    path[..BIP44_PREFIX.len()].copy_from_slice(&BIP44_PREFIX);
    path[BIP44_PREFIX.len()..].copy_from_slice(&(offset | HARDENED).to_be_bytes());
    Ok(path)
}

/// `CLA INS 00 00 Lc depth path [payload]`
fn path_command(ins: u8, path: &[u8; BIP32_PATH_SIZE], payload: &[u8]) -> Bytes {
    let data_len = path.len() + 1 + payload.len();
    let mut buf = BytesMut::with_capacity(5 + data_len);
    buf.put_u8(CLA);
    buf.put_u8(ins);
    buf.put_u16(0);
    buf.put_u8(data_len as u8);
    buf.put_u8((path.len() / 4) as u8);
    buf.put_slice(path);
    buf.put_slice(payload);
    buf.freeze()
}

pub fn public_key_command(path: &[u8; BIP32_PATH_SIZE]) -> Bytes {
    path_command(INS_GET_PUBLIC_KEY, path, &[])
}

pub fn sign_command(path: &[u8; BIP32_PATH_SIZE], payload: &[u8]) -> AppResult<Bytes> {
    if payload.len() > MAX_SIGN_PAYLOAD {
        return Err(AppError::PayloadTooLarge(payload.len()));
    }
    Ok(path_command(INS_SIGN, path, payload))
}

pub fn app_configuration_command() -> Bytes {
    Bytes::from_static(&[CLA, INS_GET_APP_CONFIGURATION, 0x00, 0x00, 0x00])
}

/// Aion application running on a connected device
pub struct AionApp<'a> {
    session: &'a Session,
}

impl<'a> AionApp<'a> {
    pub fn new(session: &'a Session) -> Self {
        Self { session }
    }

    /// Fetch the public key and address at `offset`
    pub async fn public_key(&self, offset: u32) -> AppResult<KeyAddress> {
        let command = public_key_command(&bip32_path(offset)?);
        let response = self.session.exchange(&command).await?;

        if response.len() != 2 * KEY_SIZE {
            return Err(AppError::InvalidResponseLength {
                expected: 2 * KEY_SIZE,
                actual: response.len(),
            });
        }

        let mut public_key = [0u8; KEY_SIZE];
        let mut address = [0u8; KEY_SIZE];
        public_key.copy_from_slice(&response[..KEY_SIZE]);
        address.copy_from_slice(&response[KEY_SIZE..]);

        Ok(KeyAddress {
            offset,
            public_key,
            address,
        })
    }

    /// Sign `payload` with the account at `offset`
    ///
    /// The device asks the user to confirm, so this can take a while.
    pub async fn sign(&self, offset: u32, payload: &[u8]) -> AppResult<Bytes> {
        let command = sign_command(&bip32_path(offset)?, payload)?;
        tracing::info!("Confirm the signature on the device");
        Ok(self.session.exchange(&command).await?)
    }

    pub async fn app_configuration(&self) -> AppResult<Bytes> {
        Ok(self.session.exchange(&app_configuration_command()).await?)
    }
}
