//! APK Signature Scheme v2.
//!
//! The signature covers three sections of the archive: the local entries, the central
//! directory and the end of central directory record. The signing block sits between
//! the first two and is not itself covered.

use anyhow::{bail, ensure, Context, Result};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use rasn_pkix::Certificate;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey};
use rsa::{PaddingScheme, PublicKey, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest as _, Sha256};
use std::io::Write;
use std::ops::Range;
use std::path::Path;
use tempfile::NamedTempFile;

const DEBUG_PEM: &str = include_str!("debug.pem");

const APK_SIGNING_BLOCK_MAGIC: &[u8] = b"APK Sig Block 42";
const APK_SIGNING_BLOCK_V2_ID: u32 = 0x7109871a;
const APK_SIGNING_BLOCK_V3_ID: u32 = 0xf05368c0;
const RSA_PKCS1V15_SHA2_256: u32 = 0x0103;
const MAX_CHUNK_SIZE: usize = 1024 * 1024;
const EOCD_SIZE: usize = 22;
const EOCD_SIGNATURE: u32 = 0x06054b50;

pub struct Signer {
    key: RsaPrivateKey,
    pubkey: RsaPublicKey,
    cert: Certificate,
}

impl Signer {
    /// Loads a PKCS#8 private key and its certificate from one PEM document.
    pub fn new(pem: &str) -> Result<Self> {
        let pem = pem::parse_many(pem)?;
        let key = if let Some(key) = pem.iter().find(|pem| pem.tag == "PRIVATE KEY") {
            RsaPrivateKey::from_pkcs8_der(&key.contents)?
        } else {
            bail!("no private key found");
        };
        let cert = if let Some(cert) = pem.iter().find(|pem| pem.tag == "CERTIFICATE") {
            rasn::der::decode::<Certificate>(&cert.contents)
                .map_err(|err| anyhow::anyhow!("{}", err))?
        } else {
            bail!("no certificate found");
        };
        let pubkey = RsaPublicKey::from(&key);
        Ok(Self { key, pubkey, cert })
    }

    /// The bundled debug identity.
    pub fn debug() -> Result<Self> {
        Self::new(DEBUG_PEM)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let pem = std::fs::read_to_string(path)
            .with_context(|| format!("While reading signing key `{}`", path.display()))?;
        Self::new(&pem)
    }

    pub fn sign(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        let digest = Sha256::digest(bytes);
        let padding = PaddingScheme::new_pkcs1v15_sign::<Sha256>();
        Ok(self.key.sign(padding, &digest)?)
    }

    pub fn pubkey(&self) -> &RsaPublicKey {
        &self.pubkey
    }

    pub fn cert(&self) -> &Certificate {
        &self.cert
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("pubkey", &self.pubkey)
            .finish_non_exhaustive()
    }
}

/// Signs the archive at `path` in place. Any existing signing block is replaced.
pub fn sign(path: &Path, signer: &Signer) -> Result<()> {
    let apk = std::fs::read(path)
        .with_context(|| format!("While reading `{}`", path.display()))?;
    let signed = sign_bytes(&apk, signer)?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&signed)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .with_context(|| format!("While replacing `{}`", path.display()))?;
    tracing::debug!("signed {}", path.display());
    Ok(())
}

pub fn sign_bytes(apk: &[u8], signer: &Signer) -> Result<Vec<u8>> {
    let layout = ZipLayout::parse(apk)?;
    let digest = content_digest(apk, &layout)?;
    let block = signing_block(digest, signer)?;

    let mut out = Vec::with_capacity(layout.sb_start + block.len() + apk.len() - layout.cd_start);
    out.extend_from_slice(&apk[..layout.sb_start]);
    out.extend_from_slice(&block);
    let cd_start = out.len();
    out.extend_from_slice(&apk[layout.cd_start..layout.cde_start]);
    let cde_start = out.len();
    out.extend_from_slice(&apk[layout.cde_start..]);
    LittleEndian::write_u32(&mut out[cde_start + 16..cde_start + 20], cd_start as u32);
    Ok(out)
}

/// Checks the v2 signature of the archive at `path` and returns the signers' certificates.
pub fn verify(path: &Path) -> Result<Vec<Certificate>> {
    let apk = std::fs::read(path)
        .with_context(|| format!("While reading `{}`", path.display()))?;
    verify_bytes(&apk)
}

pub fn verify_bytes(apk: &[u8]) -> Result<Vec<Certificate>> {
    let layout = ZipLayout::parse(apk)?;
    let mut v2 = None;
    for (id, range) in &layout.blocks {
        match *id {
            APK_SIGNING_BLOCK_V2_ID => v2 = Some(range.clone()),
            APK_SIGNING_BLOCK_V3_ID => tracing::debug!("ignoring v3 signing block"),
            id => tracing::debug!("unknown signing block 0x{:x}", id),
        }
    }
    let Some(range) = v2 else {
        bail!("no signing block v2 found");
    };
    let signers = parse_v2_block(&apk[range])?;
    ensure!(!signers.is_empty(), "v2 block has no signers");
    let zip_hash = content_digest(apk, &layout)?;

    let mut certificates = vec![];
    for signer in &signers {
        ensure!(!signer.signatures.is_empty(), "found no signatures in v2 block");
        let pubkey = RsaPublicKey::from_public_key_der(&signer.public_key)?;
        for (algorithm, signature) in &signer.signatures {
            ensure!(
                *algorithm == RSA_PKCS1V15_SHA2_256,
                "found unsupported signature algorithm 0x{:x}",
                algorithm
            );
            let digest = Sha256::digest(&signer.signed_data);
            let padding = PaddingScheme::new_pkcs1v15_sign::<Sha256>();
            pubkey.verify(padding, &digest, signature)?;
        }
        let signed_data = SignedData::parse(&signer.signed_data)?;
        ensure!(!signed_data.digests.is_empty(), "found no digests in v2 block");
        for digest in &signed_data.digests {
            ensure!(
                digest.algorithm == RSA_PKCS1V15_SHA2_256,
                "found unsupported digest algorithm 0x{:x}",
                digest.algorithm
            );
            ensure!(
                digest.digest == zip_hash,
                "computed hash doesn't match signed hash"
            );
        }
        for cert in &signed_data.certificates {
            let cert = rasn::der::decode::<Certificate>(cert)
                .map_err(|err| anyhow::anyhow!("{}", err))?;
            certificates.push(cert);
        }
    }
    Ok(certificates)
}

/// Offsets of the archive's sections, and the id-value pairs of its signing block if any.
#[derive(Debug)]
struct ZipLayout {
    sb_start: usize,
    cd_start: usize,
    cde_start: usize,
    blocks: Vec<(u32, Range<usize>)>,
}

impl ZipLayout {
    fn parse(apk: &[u8]) -> Result<Self> {
        let cde_start = find_eocd(apk)?;
        let cd_start = LittleEndian::read_u32(&apk[cde_start + 16..cde_start + 20]) as usize;
        ensure!(
            cd_start <= cde_start,
            "central directory offset lies past its end record"
        );
        let mut layout = Self {
            sb_start: cd_start,
            cd_start,
            cde_start,
            blocks: vec![],
        };
        if cd_start < 24 || &apk[cd_start - 16..cd_start] != APK_SIGNING_BLOCK_MAGIC {
            return Ok(layout);
        }
        let size = LittleEndian::read_u64(&apk[cd_start - 24..cd_start - 16]) as usize;
        ensure!(size >= 24, "signing block of {size} bytes is too small");
        let sb_start = size
            .checked_add(8)
            .and_then(|len| cd_start.checked_sub(len))
            .context("signing block overruns the archive")?;
        ensure!(
            LittleEndian::read_u64(&apk[sb_start..sb_start + 8]) as usize == size,
            "signing block header and footer sizes disagree"
        );
        let end = cd_start - 24;
        let mut pos = sb_start + 8;
        while pos < end {
            ensure!(pos + 12 <= end, "truncated signing block pair");
            let len = LittleEndian::read_u64(&apk[pos..pos + 8]) as usize;
            ensure!(
                len >= 4 && len <= end - pos - 8,
                "signing block pair of {len} bytes overruns the block"
            );
            let id = LittleEndian::read_u32(&apk[pos + 8..pos + 12]);
            layout.blocks.push((id, pos + 12..pos + 8 + len));
            pos += 8 + len;
        }
        layout.sb_start = sb_start;
        Ok(layout)
    }
}

fn find_eocd(apk: &[u8]) -> Result<usize> {
    ensure!(apk.len() >= EOCD_SIZE, "archive too short for a zip end record");
    let lower_bound = apk.len().saturating_sub(EOCD_SIZE + u16::MAX as usize);
    let mut pos = apk.len() - EOCD_SIZE;
    loop {
        if LittleEndian::read_u32(&apk[pos..pos + 4]) == EOCD_SIGNATURE {
            let comment_len = LittleEndian::read_u16(&apk[pos + 20..pos + 22]) as usize;
            if pos + EOCD_SIZE + comment_len == apk.len() {
                return Ok(pos);
            }
        }
        if pos == lower_bound {
            bail!("could not find the end of central directory record");
        }
        pos -= 1;
    }
}

/// The v2 content digest: a SHA-256 over the SHA-256 of every 1 MiB chunk of the three
/// signed sections, with the end record pointing at the signing block's offset.
fn content_digest(apk: &[u8], layout: &ZipLayout) -> Result<[u8; 32]> {
    let mut eocd = apk[layout.cde_start..].to_vec();
    LittleEndian::write_u32(&mut eocd[16..20], layout.sb_start as u32);
    let sections = [
        &apk[..layout.sb_start],
        &apk[layout.cd_start..layout.cde_start],
        &eocd[..],
    ];

    let mut hasher = Sha256::new();
    let mut chunks: Vec<[u8; 32]> = vec![];
    for section in sections {
        for chunk in section.chunks(MAX_CHUNK_SIZE) {
            hasher.update([0xa5]);
            hasher.update((chunk.len() as u32).to_le_bytes());
            hasher.update(chunk);
            chunks.push(hasher.finalize_reset().into());
        }
    }

    hasher.update([0x5a]);
    hasher.update((chunks.len() as u32).to_le_bytes());
    for chunk in &chunks {
        hasher.update(chunk);
    }
    Ok(hasher.finalize().into())
}

/// Splits a u32 length-prefixed field off the front of `buf`.
fn take_prefixed<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8]> {
    let len = buf.read_u32::<LittleEndian>()? as usize;
    ensure!(
        len <= buf.len(),
        "field of {len} bytes overruns the {} bytes left",
        buf.len()
    );
    let (field, rest) = buf.split_at(len);
    *buf = rest;
    Ok(field)
}

fn put_prefixed(w: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    w.write_u32::<LittleEndian>(bytes.len() as u32)?;
    w.write_all(bytes)?;
    Ok(())
}

#[derive(Debug)]
struct Digest {
    algorithm: u32,
    digest: Vec<u8>,
}

#[derive(Debug, Default)]
struct SignedData {
    digests: Vec<Digest>,
    certificates: Vec<Vec<u8>>,
    additional_attributes: Vec<(u32, Vec<u8>)>,
}

impl SignedData {
    fn new(hash: [u8; 32], signer: &Signer) -> Result<Self> {
        Ok(Self {
            digests: vec![Digest {
                algorithm: RSA_PKCS1V15_SHA2_256,
                digest: hash.to_vec(),
            }],
            certificates: vec![
                rasn::der::encode(signer.cert()).map_err(|err| anyhow::anyhow!("{}", err))?
            ],
            additional_attributes: vec![],
        })
    }

    fn parse(mut data: &[u8]) -> Result<Self> {
        let mut signed_data = Self::default();
        let mut digests = take_prefixed(&mut data)?;
        while !digests.is_empty() {
            let mut digest = take_prefixed(&mut digests)?;
            let algorithm = digest.read_u32::<LittleEndian>()?;
            let digest = take_prefixed(&mut digest)?.to_vec();
            signed_data.digests.push(Digest { algorithm, digest });
        }
        let mut certificates = take_prefixed(&mut data)?;
        while !certificates.is_empty() {
            signed_data
                .certificates
                .push(take_prefixed(&mut certificates)?.to_vec());
        }
        let mut attributes = take_prefixed(&mut data)?;
        while !attributes.is_empty() {
            let mut attribute = take_prefixed(&mut attributes)?;
            let id = attribute.read_u32::<LittleEndian>()?;
            tracing::debug!("v2: additional attribute 0x{:x}", id);
            signed_data.additional_attributes.push((id, attribute.to_vec()));
        }
        Ok(signed_data)
    }

    fn write(&self, w: &mut Vec<u8>) -> Result<()> {
        let mut digests = vec![];
        for digest in &self.digests {
            let mut record = vec![];
            record.write_u32::<LittleEndian>(digest.algorithm)?;
            put_prefixed(&mut record, &digest.digest)?;
            put_prefixed(&mut digests, &record)?;
        }
        put_prefixed(w, &digests)?;

        let mut certificates = vec![];
        for cert in &self.certificates {
            put_prefixed(&mut certificates, cert)?;
        }
        put_prefixed(w, &certificates)?;

        let mut attributes = vec![];
        for (id, value) in &self.additional_attributes {
            let mut record = vec![];
            record.write_u32::<LittleEndian>(*id)?;
            record.write_all(value)?;
            put_prefixed(&mut attributes, &record)?;
        }
        put_prefixed(w, &attributes)?;
        Ok(())
    }
}

#[derive(Debug)]
struct V2Signer {
    signed_data: Vec<u8>,
    signatures: Vec<(u32, Vec<u8>)>,
    public_key: Vec<u8>,
}

fn parse_v2_block(mut data: &[u8]) -> Result<Vec<V2Signer>> {
    let mut signers = vec![];
    let mut remaining = take_prefixed(&mut data)?;
    while !remaining.is_empty() {
        let mut signer = take_prefixed(&mut remaining)?;
        let signed_data = take_prefixed(&mut signer)?.to_vec();
        let mut signatures = vec![];
        let mut records = take_prefixed(&mut signer)?;
        while !records.is_empty() {
            let mut record = take_prefixed(&mut records)?;
            let algorithm = record.read_u32::<LittleEndian>()?;
            signatures.push((algorithm, take_prefixed(&mut record)?.to_vec()));
        }
        let public_key = take_prefixed(&mut signer)?.to_vec();
        signers.push(V2Signer {
            signed_data,
            signatures,
            public_key,
        });
    }
    Ok(signers)
}

/// A complete signing block holding a single v2 signer.
fn signing_block(hash: [u8; 32], signer: &Signer) -> Result<Vec<u8>> {
    let mut signed_data = vec![];
    SignedData::new(hash, signer)?.write(&mut signed_data)?;
    let signature = signer.sign(&signed_data)?;

    let mut signer_record = vec![];
    put_prefixed(&mut signer_record, &signed_data)?;
    let mut signature_record = vec![];
    signature_record.write_u32::<LittleEndian>(RSA_PKCS1V15_SHA2_256)?;
    put_prefixed(&mut signature_record, &signature)?;
    let mut signatures = vec![];
    put_prefixed(&mut signatures, &signature_record)?;
    put_prefixed(&mut signer_record, &signatures)?;
    put_prefixed(
        &mut signer_record,
        signer.pubkey().to_public_key_der()?.as_ref(),
    )?;
    let mut signers = vec![];
    put_prefixed(&mut signers, &signer_record)?;
    let mut v2 = vec![];
    put_prefixed(&mut v2, &signers)?;

    let size = v2.len() as u64 + 36;
    let mut block = Vec::with_capacity(size as usize + 8);
    block.write_u64::<LittleEndian>(size)?;
    block.write_u64::<LittleEndian>(v2.len() as u64 + 4)?;
    block.write_u32::<LittleEndian>(APK_SIGNING_BLOCK_V2_ID)?;
    block.write_all(&v2)?;
    block.write_u64::<LittleEndian>(size)?;
    block.write_all(APK_SIGNING_BLOCK_MAGIC)?;
    Ok(block)
}
