//! Keyring integration for secure storage of STT/LLM/TTS provider credentials.
//! Falls back to file storage if the platform keyring is unavailable.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

const SERVICE_NAME: &str = "voice-call-engine";

fn credential_dir() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "voice-call-engine", "voice-call-engine")
        .context("Failed to get project directories")?;
    let dir = base.config_dir().join("credentials");
    fs::create_dir_all(&dir).context("Failed to create credentials directory")?;
    Ok(dir)
}

fn credential_file_path(provider: &str) -> Result<PathBuf> {
    Ok(credential_dir()?.join(format!("{provider}.key")))
}

/// Store an API key for a named provider (e.g. `"stt"`, `"llm"`, `"tts"`).
/// Tries the platform keyring first, always keeps a file-backed copy too —
/// same redundancy the teacher uses for its own API key storage.
pub fn set_credential(provider: &str, key: &str) -> Result<()> {
    if let Ok(entry) = keyring::Entry::new(SERVICE_NAME, provider) {
        let _ = entry.set_password(key);
    }
    save_to_file(provider, key)?;
    Ok(())
}

fn save_to_file(provider: &str, key: &str) -> Result<()> {
    let path = credential_file_path(provider)?;
    fs::write(&path, key).context("Failed to write credential file")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
            .context("Failed to set file permissions")?;
    }

    Ok(())
}

/// Retrieve an API key for a named provider. Tries the keyring first, falls
/// back to the on-disk copy.
pub fn get_credential(provider: &str) -> Result<String> {
    if let Ok(entry) = keyring::Entry::new(SERVICE_NAME, provider) {
        if let Ok(key) = entry.get_password() {
            return Ok(key);
        }
    }

    let path = credential_file_path(provider)?;
    let key = fs::read_to_string(&path).with_context(|| {
        format!("No credential configured for '{provider}'. Run 'voice-call-engine config --set-credential {provider} <key>' first.")
    })?;
    Ok(key.trim().to_string())
}

/// Delete a provider's stored credential from both keyring and file.
pub fn delete_credential(provider: &str) -> Result<()> {
    if let Ok(entry) = keyring::Entry::new(SERVICE_NAME, provider) {
        let _ = entry.delete_credential();
    }
    let path = credential_file_path(provider)?;
    if path.exists() {
        fs::remove_file(&path).context("Failed to delete credential file")?;
    }
    Ok(())
}

/// Check whether a credential is configured for a provider.
pub fn has_credential(provider: &str) -> bool {
    if let Ok(entry) = keyring::Entry::new(SERVICE_NAME, provider) {
        if entry.get_password().is_ok() {
            return true;
        }
    }
    credential_file_path(provider)
        .map(|p| p.exists())
        .unwrap_or(false)
}
