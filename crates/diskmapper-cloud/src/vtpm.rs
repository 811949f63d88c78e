//! Quote issuer backed by the instance vTPM through tpm2-tools.
//!
//! Azure and GCE quotes are signed by the attestation key their provisioned
//! certificate covers: the persistent Azure AK, or the GCE AK recreated from
//! its NV template. QEMU has no such key, so a fresh EK/AK pair is created.
//! Every quote gets its own scratch directory; nothing is cached.

use diskmapper_core::error::{DiskMapperError, DiskMapperResult};
use diskmapper_core::exec::{BoundedCommand, CommandOutput};
use diskmapper_core::DiskMapperConfig;
use diskmapper_provider::{AttestationQuote, PcrValue, Platform, QuoteIssuer};
use log::{debug, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

const TCTI_ENV: &str = "TPM2TOOLS_TCTI";
const PCR_BANK: &str = "sha256";
const SHA256_LEN: usize = 32;

/// NV index holding the provisioned AK certificate on Azure confidential VMs.
const AZURE_AK_CERT_NV_INDEX: u32 = 0x01C1_01D0;
/// Persistent handle of the provisioned AK on Azure confidential VMs.
const AZURE_AK_HANDLE: u32 = 0x8100_0003;
/// NV index holding the RSA AK certificate on GCE shielded VMs.
const GCP_AK_CERT_NV_INDEX: u32 = 0x01C1_0000;
/// NV index holding the template the GCE RSA AK was created from.
const GCP_AK_TEMPLATE_NV_INDEX: u32 = 0x01C1_0001;

/// How to reach tpm2-tools and which registers to quote.
#[derive(Debug, Clone)]
pub struct TpmSettings {
    /// TCTI handed to each tool through its own environment, never ours.
    pub tcti: Option<String>,
    pub pcrs: Vec<u32>,
    pub timeout: Duration,
    /// Directory holding the `tpm2_*` binaries; `None` uses `PATH`.
    pub tools_dir: Option<PathBuf>,
}

impl TpmSettings {
    pub fn from_config(config: &DiskMapperConfig) -> Self {
        Self {
            tcti: config.attestation.tpm_device.clone(),
            pcrs: config.attestation.pcrs.clone(),
            timeout: config.tools_timeout(),
            tools_dir: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VtpmQuoteIssuer {
    platform: Platform,
    settings: TpmSettings,
    pcrs: Vec<u32>,
}

impl VtpmQuoteIssuer {
    pub fn new(platform: Platform, settings: TpmSettings) -> Self {
        let mut pcrs = settings.pcrs.clone();
        pcrs.sort_unstable();
        pcrs.dedup();
        Self {
            platform,
            settings,
            pcrs,
        }
    }

    fn ak_cert_index(&self) -> Option<u32> {
        match self.platform {
            Platform::Azure => Some(AZURE_AK_CERT_NV_INDEX),
            Platform::Gcp => Some(GCP_AK_CERT_NV_INDEX),
            Platform::Qemu => None,
        }
    }

    fn selection(&self) -> String {
        let list = self
            .pcrs
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        format!("{PCR_BANK}:{list}")
    }

    fn tool(&self, name: &str) -> BoundedCommand {
        let binary = match &self.settings.tools_dir {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        };
        let command = BoundedCommand::new(binary, self.settings.timeout);
        match &self.settings.tcti {
            Some(tcti) => command.with_env(TCTI_ENV, tcti.as_str()),
            None => command,
        }
    }

    fn run(&self, name: &str, args: &[&str]) -> DiskMapperResult<CommandOutput> {
        let out = self
            .tool(name)
            .run(args, None)
            .map_err(|err| DiskMapperError::Attestation(format!("{name}: {err}")))?;
        if !out.success() {
            return Err(DiskMapperError::Attestation(format!(
                "{name} failed (exit code {}): {}",
                out.status,
                out.diagnostic()
            )));
        }
        Ok(out)
    }

    fn read_pcrs(&self, work_dir: &Path) -> DiskMapperResult<Vec<PcrValue>> {
        let output = work_dir.join("pcrs.bin");
        let output_arg = output.to_string_lossy();
        let selection = self.selection();
        self.run("tpm2_pcrread", &["-o", &output_arg, &selection])?;

        let data = read_artifact(&output)?;
        if data.len() != self.pcrs.len() * SHA256_LEN {
            return Err(DiskMapperError::Attestation(format!(
                "tpm2_pcrread returned {} bytes for {} registers",
                data.len(),
                self.pcrs.len()
            )));
        }
        Ok(self
            .pcrs
            .iter()
            .zip(data.chunks_exact(SHA256_LEN))
            .map(|(index, value)| PcrValue {
                index: *index,
                value: value.to_vec(),
            })
            .collect())
    }

    /// Make the signing key available and export its public area to `ak_pub`.
    ///
    /// Returns the `-c` argument `tpm2_quote` signs with. On the cloud
    /// platforms this is the AK their certificate covers.
    fn load_ak(&self, work_dir: &Path, ak_pub: &Path) -> DiskMapperResult<String> {
        let ak_pub_arg = ak_pub.to_string_lossy();
        let ak_ctx = work_dir.join("ak.ctx");
        let ak_ctx_arg = ak_ctx.to_string_lossy().into_owned();

        match self.platform {
            Platform::Azure => {
                let handle = format!("0x{AZURE_AK_HANDLE:08x}");
                self.run("tpm2_readpublic", &["-c", &handle, "-o", &ak_pub_arg])?;
                Ok(handle)
            }
            Platform::Gcp => {
                let template_path = work_dir.join("ak.template");
                let template_arg = template_path.to_string_lossy();
                let index_arg = format!("0x{GCP_AK_TEMPLATE_NV_INDEX:08x}");
                self.run("tpm2_nvread", &["-C", "o", &index_arg, "-o", &template_arg])?;
                let template = AkTemplate::parse(&read_artifact(&template_path)?)?;
                debug!("recreating GCE AK from template ({})", template.key_alg);

                let attributes = format!("0x{:08x}", template.attributes);
                let mut args = vec![
                    "-C",
                    "e",
                    "-G",
                    template.key_alg.as_str(),
                    "-g",
                    template.name_alg,
                    "-a",
                    attributes.as_str(),
                ];
                let policy_path = work_dir.join("ak.policy");
                let policy_arg = policy_path.to_string_lossy();
                if !template.auth_policy.is_empty() {
                    fs::write(&policy_path, &template.auth_policy)?;
                    args.extend(["-L", &*policy_arg]);
                }
                args.extend(["-c", ak_ctx_arg.as_str()]);
                self.run("tpm2_createprimary", &args)?;
                self.run("tpm2_readpublic", &["-c", &ak_ctx_arg, "-o", &ak_pub_arg])?;
                Ok(ak_ctx_arg)
            }
            Platform::Qemu => {
                let ek_ctx = work_dir.join("ek.ctx");
                let ek_ctx_arg = ek_ctx.to_string_lossy();
                self.run("tpm2_createek", &["-c", &ek_ctx_arg, "-G", "rsa"])?;
                self.run(
                    "tpm2_createak",
                    &[
                        "-C", &ek_ctx_arg, "-c", &ak_ctx_arg, "-u", &ak_pub_arg, "-G", "rsa", "-g",
                        "sha256",
                    ],
                )?;
                Ok(ak_ctx_arg)
            }
        }
    }

    fn read_ak_cert(&self) -> Option<Vec<u8>> {
        let index = self.ak_cert_index()?;
        let index_arg = format!("0x{index:08x}");
        match self.run("tpm2_nvread", &["-C", "o", &index_arg]) {
            Ok(out) if !out.stdout.is_empty() => {
                debug!("read AK certificate from NV index {index_arg} ({} bytes)", out.stdout.len());
                Some(out.stdout)
            }
            Ok(_) => {
                warn!("NV index {index_arg} holds no AK certificate");
                None
            }
            Err(err) => {
                warn!("AK certificate unavailable: {err}");
                None
            }
        }
    }
}

impl QuoteIssuer for VtpmQuoteIssuer {
    type Error = DiskMapperError;

    fn platform(&self) -> Platform {
        self.platform
    }

    fn issue(&self, user_data: &[u8]) -> DiskMapperResult<AttestationQuote> {
        let work_dir = TempDir::new()?;
        let path = |name: &str| work_dir.path().join(name);
        let ak_pub = path("ak.pub");
        let qualifying = path("qualifying.bin");
        let message = path("quote.msg");
        let signature = path("quote.sig");

        let ak = self.load_ak(work_dir.path(), &ak_pub)?;
        let pcrs = self.read_pcrs(work_dir.path())?;

        fs::write(&qualifying, user_data)?;
        let qualifying_arg = qualifying.to_string_lossy();
        let message_arg = message.to_string_lossy();
        let signature_arg = signature.to_string_lossy();
        let selection = self.selection();
        self.run(
            "tpm2_quote",
            &[
                "-c",
                &ak,
                "-l",
                &selection,
                "-m",
                &message_arg,
                "-s",
                &signature_arg,
                "-q",
                &qualifying_arg,
            ],
        )?;

        Ok(AttestationQuote {
            platform: self.platform,
            message: read_artifact(&message)?,
            signature: read_artifact(&signature)?,
            ak_public: read_artifact(&ak_pub)?,
            ak_cert: self.read_ak_cert(),
            qualifying_data: user_data.to_vec(),
            pcrs,
        })
    }
}

/// Fields of a `TPMT_PUBLIC` RSA signing template that `tpm2_createprimary` needs.
#[derive(Debug, Clone, PartialEq, Eq)]
struct AkTemplate {
    /// tpm2-tools algorithm spec, e.g. `rsa2048:rsassa-sha256:null`.
    key_alg: String,
    name_alg: &'static str,
    attributes: u32,
    auth_policy: Vec<u8>,
}

impl AkTemplate {
    fn parse(raw: &[u8]) -> DiskMapperResult<Self> {
        let mut cursor = TemplateCursor { raw, pos: 0 };

        let key_type = cursor.u16()?;
        if key_type != TPM_ALG_RSA {
            return Err(template_error(format!(
                "unsupported key type 0x{key_type:04x}"
            )));
        }
        let name_alg = hash_name(cursor.u16()?)?;
        let attributes = cursor.u32()?;
        let policy_len = usize::from(cursor.u16()?);
        let auth_policy = cursor.bytes(policy_len)?.to_vec();

        let symmetric = cursor.u16()?;
        if symmetric != TPM_ALG_NULL {
            return Err(template_error(format!(
                "signing key carries symmetric algorithm 0x{symmetric:04x}"
            )));
        }
        let scheme = match cursor.u16()? {
            TPM_ALG_RSASSA => "rsassa",
            TPM_ALG_RSAPSS => "rsapss",
            other => {
                return Err(template_error(format!(
                    "unsupported signing scheme 0x{other:04x}"
                )))
            }
        };
        let scheme_hash = hash_name(cursor.u16()?)?;
        let key_bits = cursor.u16()?;
        let exponent = cursor.u32()?;
        if exponent != 0 && exponent != 65_537 {
            return Err(template_error(format!("unsupported RSA exponent {exponent}")));
        }

        Ok(Self {
            key_alg: format!("rsa{key_bits}:{scheme}-{scheme_hash}:null"),
            name_alg,
            attributes,
            auth_policy,
        })
    }
}

const TPM_ALG_RSA: u16 = 0x0001;
const TPM_ALG_NULL: u16 = 0x0010;
const TPM_ALG_RSASSA: u16 = 0x0014;
const TPM_ALG_RSAPSS: u16 = 0x0016;

fn hash_name(alg: u16) -> DiskMapperResult<&'static str> {
    match alg {
        0x0004 => Ok("sha1"),
        0x000B => Ok("sha256"),
        0x000C => Ok("sha384"),
        0x000D => Ok("sha512"),
        other => Err(template_error(format!("unsupported hash algorithm 0x{other:04x}"))),
    }
}

fn template_error(reason: String) -> DiskMapperError {
    DiskMapperError::Attestation(format!("AK template: {reason}"))
}

struct TemplateCursor<'a> {
    raw: &'a [u8],
    pos: usize,
}

impl<'a> TemplateCursor<'a> {
    fn bytes(&mut self, len: usize) -> DiskMapperResult<&'a [u8]> {
        let end = self.pos + len;
        let slice = self
            .raw
            .get(self.pos..end)
            .ok_or_else(|| template_error(format!("truncated at byte {}", self.pos)))?;
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self) -> DiskMapperResult<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> DiskMapperResult<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

fn read_artifact(path: &Path) -> DiskMapperResult<Vec<u8>> {
    fs::read(path).map_err(|err| {
        DiskMapperError::Attestation(format!("reading {}: {err}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer(platform: Platform, pcrs: Vec<u32>) -> VtpmQuoteIssuer {
        VtpmQuoteIssuer::new(
            platform,
            TpmSettings {
                tcti: None,
                pcrs,
                timeout: Duration::from_secs(1),
                tools_dir: None,
            },
        )
    }

    #[test]
    fn selection_is_sorted_and_deduplicated() {
        let issuer = issuer(Platform::Gcp, vec![7, 0, 4, 7]);
        assert_eq!(issuer.selection(), "sha256:0,4,7");
    }

    #[test]
    fn only_cloud_platforms_read_an_ak_certificate() {
        assert_eq!(issuer(Platform::Azure, vec![0]).ak_cert_index(), Some(0x01C101D0));
        assert_eq!(issuer(Platform::Gcp, vec![0]).ak_cert_index(), Some(0x01C10000));
        assert_eq!(issuer(Platform::Qemu, vec![0]).ak_cert_index(), None);
    }

    fn gce_rsa_template(policy: &[u8]) -> Vec<u8> {
        let mut raw = Vec::new();
        raw.extend(0x0001u16.to_be_bytes());
        raw.extend(0x000Bu16.to_be_bytes());
        raw.extend(0x0005_0472u32.to_be_bytes());
        raw.extend((policy.len() as u16).to_be_bytes());
        raw.extend(policy);
        raw.extend(0x0010u16.to_be_bytes());
        raw.extend(0x0014u16.to_be_bytes());
        raw.extend(0x000Bu16.to_be_bytes());
        raw.extend(2048u16.to_be_bytes());
        raw.extend(0u32.to_be_bytes());
        raw.extend(0u16.to_be_bytes());
        raw
    }

    #[test]
    fn rsa_signing_template_maps_to_createprimary_arguments() {
        let template = AkTemplate::parse(&gce_rsa_template(&[])).unwrap();
        assert_eq!(template.key_alg, "rsa2048:rsassa-sha256:null");
        assert_eq!(template.name_alg, "sha256");
        assert_eq!(template.attributes, 0x0005_0472);
        assert!(template.auth_policy.is_empty());

        let with_policy = AkTemplate::parse(&gce_rsa_template(&[0xab; 32])).unwrap();
        assert_eq!(with_policy.auth_policy, vec![0xab; 32]);
    }

    #[test]
    fn malformed_templates_are_attestation_errors() {
        let full = gce_rsa_template(&[]);
        let mut ecc = full.clone();
        ecc[1] = 0x23;
        for raw in [&full[..9], &ecc[..], &[][..]] {
            match AkTemplate::parse(raw) {
                Err(DiskMapperError::Attestation(reason)) => {
                    assert!(reason.starts_with("AK template"), "{reason}")
                }
                other => panic!("unexpected result: {other:?}"),
            }
        }
    }
}
