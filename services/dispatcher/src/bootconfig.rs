//! Runner boot configuration (cloud-init user-data).
//!
//! Each new runner gets its own user-data document, rendered from the pool's
//! template file and published as a snippet the hypervisor attaches to the
//! VM's cloud-init drive.
//!
//! Template placeholders are `$name` or `${name}`; `$$` is a literal `$`.
//! Rendering is strict: unknown names and stray `$` are errors.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use fleet_reconcile::Pool;
use tracing::debug;

use crate::error::{DispatchError, DispatchResult};
use crate::hypervisor::Hypervisor;
use crate::task::TaskWaiter;

/// Values substituted into a boot-config template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootConfigValues {
    pub repo_url: String,
    pub registration_token: String,
    /// Comma-joined runner labels.
    pub runner_labels: String,
    pub runner_name: String,
    pub runner_user: String,
}

impl BootConfigValues {
    fn get(&self, key: &str) -> Option<&str> {
        match key {
            "repo_url" => Some(&self.repo_url),
            "registration_token" => Some(&self.registration_token),
            "runner_labels" => Some(&self.runner_labels),
            "runner_name" => Some(&self.runner_name),
            "runner_user" => Some(&self.runner_user),
            _ => None,
        }
    }
}

fn identifier_len(s: &str) -> usize {
    let bytes = s.as_bytes();
    match bytes.first() {
        Some(b) if b.is_ascii_alphabetic() || *b == b'_' => {}
        _ => return 0,
    }
    bytes
        .iter()
        .take_while(|b| b.is_ascii_alphanumeric() || **b == b'_')
        .count()
}

fn position(template: &str, offset: usize) -> (usize, usize) {
    let before = &template[..offset];
    let line = before.matches('\n').count() + 1;
    let col = before
        .rsplit('\n')
        .next()
        .map(|l| l.chars().count() + 1)
        .unwrap_or(1);
    (line, col)
}

/// Render `template`, substituting every placeholder from `values`.
pub fn render(template: &str, values: &BootConfigValues) -> DispatchResult<String> {
    let mut out = String::with_capacity(template.len() + 256);
    let mut rest = template;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let offset = template.len() - rest.len() + pos;
        let after = &rest[pos + 1..];

        if let Some(tail) = after.strip_prefix('$') {
            out.push('$');
            rest = tail;
            continue;
        }

        let (name, consumed) = match after.strip_prefix('{') {
            Some(braced) => {
                let len = identifier_len(braced);
                if len == 0 || braced.as_bytes().get(len) != Some(&b'}') {
                    let (line, col) = position(template, offset);
                    return Err(DispatchError::Render(format!(
                        "invalid placeholder at line {line}, col {col}"
                    )));
                }
                (&braced[..len], len + 2)
            }
            None => {
                let len = identifier_len(after);
                if len == 0 {
                    let (line, col) = position(template, offset);
                    return Err(DispatchError::Render(format!(
                        "invalid placeholder at line {line}, col {col}"
                    )));
                }
                (&after[..len], len)
            }
        };

        let value = values.get(name).ok_or_else(|| {
            let (line, col) = position(template, offset);
            DispatchError::Render(format!(
                "unknown placeholder ${name} at line {line}, col {col}"
            ))
        })?;
        out.push_str(value);
        rest = &after[consumed..];
    }

    out.push_str(rest);
    Ok(out)
}

/// Read and render a template file.
pub async fn render_file(path: &Path, values: &BootConfigValues) -> DispatchResult<String> {
    let template = tokio::fs::read_to_string(path).await.map_err(|e| {
        DispatchError::Render(format!("cannot read template {}: {e}", path.display()))
    })?;
    render(&template, values)
        .map_err(|e| DispatchError::Render(format!("{}: {e}", path.display())))
}

/// Snippet file name for an instance.
pub fn snippet_file_name(instance_name: &str) -> String {
    format!("{instance_name}.yaml")
}

/// `cicustom` volume spec pointing at a snippet on `storage`.
pub fn cicustom(storage: &str, file_name: &str) -> String {
    format!("user={storage}:snippets/{file_name}")
}

/// Makes rendered documents reachable by the hypervisor.
///
/// With a snippets directory the file is written locally (the directory is
/// expected to back the pool's snippet storage); otherwise it is uploaded to
/// the pool's storage through the hypervisor API.
pub struct SnippetPublisher {
    snippets_dir: Option<PathBuf>,
    hypervisor: Arc<dyn Hypervisor>,
    waiter: TaskWaiter,
}

impl SnippetPublisher {
    pub fn new(
        snippets_dir: Option<PathBuf>,
        hypervisor: Arc<dyn Hypervisor>,
        waiter: TaskWaiter,
    ) -> Self {
        Self {
            snippets_dir,
            hypervisor,
            waiter,
        }
    }

    /// Publish `contents` as `file_name` for `pool`; returns the `cicustom` spec.
    pub async fn publish(
        &self,
        pool: &Pool,
        file_name: &str,
        contents: String,
    ) -> DispatchResult<String> {
        match &self.snippets_dir {
            Some(dir) => {
                tokio::fs::create_dir_all(dir).await?;
                let path = dir.join(file_name);
                tokio::fs::write(&path, contents).await?;
                debug!(path = %path.display(), "Wrote boot-config snippet");
            }
            None => {
                let task = self
                    .hypervisor
                    .upload_snippet(pool.node(), pool.storage(), file_name, contents)
                    .await?;
                self.waiter.wait(pool.node(), task).await?;
                debug!(storage = pool.storage(), file = file_name, "Uploaded boot-config snippet");
            }
        }
        Ok(cicustom(pool.storage(), file_name))
    }
}
