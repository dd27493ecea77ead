//! Certificate generation for first-time pairing
//!
//! A pairing produces three certificates: a self-signed root, a host
//! certificate for TLS client identity, and a device certificate built over
//! the public key the device hands out. All are 2048-bit RSA, SHA-256
//! signed, valid for ten years, with empty names as lockdownd expects.

use openssl::{
    asn1::Asn1Time,
    bn::BigNum,
    error::ErrorStack,
    hash::MessageDigest,
    pkey::{HasPublic, PKey, PKeyRef, Private, Public},
    rsa::Rsa,
    x509::{
        extension::{BasicConstraints, KeyUsage},
        X509Builder, X509NameBuilder, X509,
    },
};

const RSA_KEY_BITS: u32 = 2048;
const VALIDITY_DAYS: u32 = 365 * 10;

#[derive(Debug)]
pub(crate) struct GeneratedCertificates {
    pub root_certificate: X509,
    pub host_certificate: X509,
    pub device_certificate: X509,
    pub root_private_key: PKey<Private>,
    pub host_private_key: PKey<Private>,
}

fn make_cert<T: HasPublic>(
    serial: u32,
    public_key: &PKeyRef<T>,
    signer: &PKeyRef<Private>,
    ca: bool,
) -> Result<X509, ErrorStack> {
    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;

    let serial = BigNum::from_u32(serial)?.to_asn1_integer()?;
    builder.set_serial_number(&serial)?;

    let name = X509NameBuilder::new()?.build();
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;

    let not_before = Asn1Time::days_from_now(0)?;
    builder.set_not_before(&not_before)?;
    let not_after = Asn1Time::days_from_now(VALIDITY_DAYS)?;
    builder.set_not_after(&not_after)?;
    builder.set_pubkey(public_key)?;

    if ca {
        builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
    } else {
        builder.append_extension(BasicConstraints::new().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .critical()
                .digital_signature()
                .key_encipherment()
                .build()?,
        )?;
    }

    builder.sign(signer, MessageDigest::sha256())?;
    Ok(builder.build())
}

/// Parses the `DevicePublicKey` lockdown hands out (PKCS#1, PEM or DER)
fn parse_device_public_key(bytes: &[u8]) -> Result<Rsa<Public>, ErrorStack> {
    Rsa::public_key_from_pem_pkcs1(bytes)
        .or_else(|_| Rsa::public_key_from_pem(bytes))
        .or_else(|_| Rsa::public_key_from_der_pkcs1(bytes))
}

/// Generates the certificate material for a new pair record
///
/// With `device_public_key` absent a throwaway device key is generated,
/// which is only useful for exercising the record plumbing in tests.
pub(crate) fn generate_certificates(
    device_public_key: Option<&[u8]>,
) -> Result<GeneratedCertificates, ErrorStack> {
    let root_private_key = PKey::from_rsa(Rsa::generate(RSA_KEY_BITS)?)?;
    let host_private_key = PKey::from_rsa(Rsa::generate(RSA_KEY_BITS)?)?;

    let device_public_key: PKey<Public> = match device_public_key {
        Some(bytes) => PKey::from_rsa(parse_device_public_key(bytes)?)?,
        None => {
            let throwaway = Rsa::generate(RSA_KEY_BITS)?;
            PKey::from_rsa(Rsa::public_key_from_pem(&throwaway.public_key_to_pem()?)?)?
        }
    };

    let root_certificate = make_cert(1, &root_private_key, &root_private_key, true)?;
    let host_certificate = make_cert(2, &host_private_key, &root_private_key, false)?;
    let device_certificate = make_cert(3, &device_public_key, &root_private_key, false)?;

    Ok(GeneratedCertificates {
        root_certificate,
        host_certificate,
        device_certificate,
        root_private_key,
        host_private_key,
    })
}
