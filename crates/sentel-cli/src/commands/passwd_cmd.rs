use anyhow::{bail, Context, Result};
use clap::Args;
use sentel_broker::broker::auth::{hash_password, DEFAULT_HASH_COST};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct PasswdCommand {
    /// Username to add, update or delete
    pub username: String,

    /// Password file to update; without it the entry is printed
    pub file: Option<PathBuf>,

    /// Password on the command line (visible in the process list); prompts when omitted
    #[arg(long, short, conflicts_with = "delete")]
    pub password: Option<String>,

    /// Delete the user instead of setting a password
    #[arg(long, short = 'D', requires = "file")]
    pub delete: bool,

    /// bcrypt cost factor (4-31)
    #[arg(long, default_value_t = DEFAULT_HASH_COST)]
    pub cost: u32,
}

pub fn execute(cmd: &PasswdCommand) -> Result<()> {
    if cmd.username.is_empty() || cmd.username.contains(':') {
        bail!("Username must be non-empty and cannot contain ':'");
    }
    if !(4..=31).contains(&cmd.cost) {
        bail!("bcrypt cost must be between 4 and 31");
    }

    let Some(path) = &cmd.file else {
        let password = read_password(cmd)?;
        println!("{}:{}", cmd.username, hash(&password, cmd.cost)?);
        return Ok(());
    };

    let mut users = if path.exists() {
        read_password_file(path)?
    } else {
        BTreeMap::new()
    };

    if cmd.delete {
        if users.remove(&cmd.username).is_none() {
            bail!("User '{}' not found in {}", cmd.username, path.display());
        }
        write_password_file(path, &users)?;
        println!("Deleted user: {}", cmd.username);
        return Ok(());
    }

    let password = read_password(cmd)?;
    let action = if users.contains_key(&cmd.username) {
        "Updated"
    } else {
        "Added"
    };
    users.insert(cmd.username.clone(), hash(&password, cmd.cost)?);
    write_password_file(path, &users)?;
    println!("{action} user: {}", cmd.username);
    Ok(())
}

fn hash(password: &str, cost: u32) -> Result<String> {
    hash_password(password.as_bytes(), cost).context("Failed to hash password")
}

fn read_password(cmd: &PasswdCommand) -> Result<String> {
    if let Some(password) = &cmd.password {
        if password.is_empty() {
            bail!("Password cannot be empty");
        }
        return Ok(password.clone());
    }

    let password = rpassword::prompt_password("Password: ").context("Failed to read password")?;
    if password.is_empty() {
        bail!("Password cannot be empty");
    }
    let confirmation = rpassword::prompt_password("Confirm password: ")
        .context("Failed to read password confirmation")?;
    confirm_password(password, &confirmation)
}

fn confirm_password(password: String, confirmation: &str) -> Result<String> {
    if password != confirmation {
        bail!("Passwords do not match");
    }
    Ok(password)
}

fn read_password_file(path: &Path) -> Result<BTreeMap<String, String>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read password file: {}", path.display()))?;

    let mut users = BTreeMap::new();
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((username, hash)) = line.split_once(':') else {
            bail!("Invalid entry at line {} of {}", index + 1, path.display());
        };
        users.insert(username.trim().to_string(), hash.trim().to_string());
    }
    Ok(users)
}

fn write_password_file(path: &Path, users: &BTreeMap<String, String>) -> Result<()> {
    let content: String = users
        .iter()
        .map(|(username, hash)| format!("{username}:{hash}\n"))
        .collect();
    fs::write(path, content)
        .with_context(|| format!("Failed to write password file: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(username: &str, file: &Path, password: Option<&str>, delete: bool) -> PasswdCommand {
        PasswdCommand {
            username: username.to_string(),
            file: Some(file.to_path_buf()),
            password: password.map(str::to_string),
            delete,
            cost: 4,
        }
    }

    #[test]
    fn test_add_update_delete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("passwd");

        execute(&command("bob", &path, Some("one"), false)).unwrap();
        execute(&command("alice", &path, Some("two"), false)).unwrap();
        execute(&command("bob", &path, Some("three"), false)).unwrap();

        let users = read_password_file(&path).unwrap();
        assert_eq!(users.keys().collect::<Vec<_>>(), vec!["alice", "bob"]);
        assert!(sentel_broker::broker::auth::verify_password(b"three", &users["bob"]));
        assert!(!sentel_broker::broker::auth::verify_password(b"one", &users["bob"]));

        execute(&command("alice", &path, None, true)).unwrap();
        assert!(execute(&command("alice", &path, None, true)).is_err());
        assert_eq!(read_password_file(&path).unwrap().len(), 1);
    }

    #[test]
    fn test_username_with_colon_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("passwd");
        assert!(execute(&command("a:b", &path, Some("x"), false)).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_confirmation_must_match() {
        assert_eq!(confirm_password("s3cret".to_string(), "s3cret").unwrap(), "s3cret");
        assert!(confirm_password("s3cret".to_string(), "s3cre").is_err());
    }

    #[test]
    fn test_cost_out_of_range_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("passwd");
        let mut cmd = command("bob", &path, Some("x"), false);
        cmd.cost = 3;
        assert!(execute(&cmd).is_err());
        assert!(!path.exists());
    }
}
