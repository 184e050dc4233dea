//! Bridge between the versioned store's logical tree and the Git wire
//! protocol: synthesizes blobs/trees/commits for the current branch head
//! and keeps the store-commit → git-commit SHA mapping stable.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::db::{self, Repository};
use crate::error::HubError;
use crate::git::objects::{self, CommitIdentity, GitObject};
use crate::git::pkt;
use crate::repo::{LfsPolicy, RepoType, lakefs_repo_name};
use crate::store::AppState;

/// Deterministic mapping from versioned-store commit SHAs to synthesized
/// Git commit SHA-1s, so advertised refs and returned packs agree.
#[derive(Debug, Default)]
pub struct GitShaCache {
    map: Mutex<HashMap<String, String>>,
}

impl GitShaCache {
    pub fn get(&self, store_commit: &str) -> Option<String> {
        self.map.lock().expect("git sha cache").get(store_commit).cloned()
    }

    pub fn insert(&self, store_commit: String, git_sha: String) {
        self.map.lock().expect("git sha cache").insert(store_commit, git_sha);
    }
}

/// Fully materialized branch head: everything needed to answer a fetch.
#[derive(Debug)]
pub struct Snapshot {
    pub store_commit: String,
    pub git_commit_sha: String,
    pub objects: Vec<GitObject>,
}

/// Advertised capabilities.
pub fn upload_pack_capabilities() -> String {
    format!(
        "multi_ack multi_ack_detailed side-band-64k thin-pack ofs-delta agent=kohakuhub/{}",
        env!("CARGO_PKG_VERSION")
    )
}

pub fn receive_pack_capabilities() -> String {
    format!(
        "report-status side-band-64k delete-refs ofs-delta agent=kohakuhub/{}",
        env!("CARGO_PKG_VERSION")
    )
}

/// Head commit id of `main`, or `None` for a repo with no commits yet.
async fn branch_head(state: &AppState, repo: &Repository) -> Result<Option<String>, HubError> {
    let repo_type = RepoType::parse(&repo.repo_type)?;
    let lakefs_repo = lakefs_repo_name(repo_type, &repo.namespace, &repo.name);

    match state.lakefs.get_branch(&lakefs_repo, "main").await {
        Ok(branch) if branch.commit_id.is_empty() => Ok(None),
        Ok(branch) => Ok(Some(branch.commit_id)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(HubError::UpstreamUnavailable(e.to_string())),
    }
}

/// Build the full object set for the branch head.
///
/// LFS files always become pointer blobs; regular files are fetched from
/// the store. CPU-heavy hashing and tree assembly run on the blocking
/// pool.
pub async fn build_snapshot(
    state: &AppState,
    repo: &Repository,
) -> Result<Option<Snapshot>, HubError> {
    let Some(store_commit) = branch_head(state, repo).await? else {
        return Ok(None);
    };

    let repo_type = RepoType::parse(&repo.repo_type)?;
    let lakefs_repo = lakefs_repo_name(repo_type, &repo.namespace, &repo.name);

    let commit_record = state
        .lakefs
        .get_commit(&lakefs_repo, &store_commit)
        .await
        .map_err(|e| HubError::UpstreamUnavailable(e.to_string()))?;

    let listing = state
        .lakefs
        .list_all_objects(&lakefs_repo, &store_commit, "", "")
        .await
        .map_err(|e| HubError::UpstreamUnavailable(e.to_string()))?;

    let file_rows: HashMap<String, db::FileRow> = db::list_files(&state.pool, &repo.id)
        .await?
        .into_iter()
        .map(|row| (row.path_in_repo.clone(), row))
        .collect();
    let policy = LfsPolicy::effective(repo, &state.config.app);

    // (path, content) for every blob we will emit.
    let mut file_contents: Vec<(String, Vec<u8>)> = Vec::new();
    for object in listing.iter().filter(|o| o.is_object()) {
        let row = file_rows.get(&object.path);
        let is_lfs = row.map_or_else(
            || policy.is_lfs(&object.path, object.size_bytes),
            |row| row.lfs,
        );

        let content = if is_lfs {
            let oid = row
                .map(|row| row.sha256.clone())
                .filter(|oid| oid.len() == 64)
                .unwrap_or_else(|| object.checksum.clone());
            objects::lfs_pointer(&oid, object.size_bytes)
        } else {
            state
                .lakefs
                .get_object(&lakefs_repo, &store_commit, &object.path)
                .await
                .map_err(|e| HubError::UpstreamUnavailable(e.to_string()))?
        };
        file_contents.push((object.path.clone(), content));
    }

    // Author attribution comes from the recorded Commit row when we have
    // one (the store itself does not track authorship); the configured
    // identity is the fallback and always supplies the email.
    let identity_name = db::get_commit_author(&state.pool, &repo.id, &store_commit)
        .await?
        .map_or_else(
            || state.config.app.git_author_name.clone(),
            |row| row.username,
        );
    let identity_email = state.config.app.git_author_email.clone();
    let message = if commit_record.message.is_empty() {
        "Initial commit".to_owned()
    } else {
        commit_record.message.clone()
    };
    let timestamp = commit_record.creation_date;

    let snapshot = tokio::task::spawn_blocking(move || {
        let mut all_objects = Vec::with_capacity(file_contents.len() + 4);
        let mut blob_refs = Vec::with_capacity(file_contents.len());

        for (path, content) in file_contents {
            let blob = objects::blob_object(&content);
            blob_refs.push((path, blob.sha1_hex()));
            all_objects.push(blob);
        }

        let (root_tree, trees) = objects::build_nested_trees(&blob_refs);
        all_objects.extend(trees);

        let commit = objects::commit_object(
            &root_tree,
            &[],
            &CommitIdentity {
                name: &identity_name,
                email: &identity_email,
            },
            timestamp,
            &message,
        );
        let git_commit_sha = commit.sha1_hex();
        all_objects.push(commit);

        (git_commit_sha, all_objects)
    })
    .await
    .map_err(|e| HubError::Internal(e.into()))?;

    let (git_commit_sha, all_objects) = snapshot;
    state
        .git_shas
        .insert(store_commit.clone(), git_commit_sha.clone());

    Ok(Some(Snapshot {
        store_commit,
        git_commit_sha,
        objects: all_objects,
    }))
}

/// Refs advertised for the repo: `HEAD` plus `refs/heads/main`, empty
/// when there is nothing to serve. Uses the cached SHA mapping when the
/// head has been materialized before.
pub async fn get_refs(
    state: &AppState,
    repo: &Repository,
) -> Result<Vec<(String, String)>, HubError> {
    let Some(store_commit) = branch_head(state, repo).await? else {
        return Ok(Vec::new());
    };

    let git_sha = match state.git_shas.get(&store_commit) {
        Some(sha) => sha,
        None => match build_snapshot(state, repo).await? {
            Some(snapshot) => snapshot.git_commit_sha,
            None => return Ok(Vec::new()),
        },
    };

    Ok(vec![
        ("HEAD".to_owned(), git_sha.clone()),
        ("refs/heads/main".to_owned(), git_sha),
    ])
}

/// info/refs advertisement: service banner, flush, refs (capabilities on
/// the first line after a NUL), flush.
pub fn service_advertisement(
    service: &str,
    refs: &[(String, String)],
    capabilities: &str,
) -> Vec<u8> {
    let banner = format!("# service={service}\n");
    let mut out = pkt::pkt_line(Some(banner.as_bytes()));
    out.extend_from_slice(&pkt::pkt_line(None));

    if refs.is_empty() {
        let line = format!("{} capabilities^{{}}\0{capabilities}\n", "0".repeat(40));
        out.extend_from_slice(&pkt::pkt_line(Some(line.as_bytes())));
    } else {
        for (index, (ref_name, sha)) in refs.iter().enumerate() {
            let line = if index == 0 {
                format!("{sha} {ref_name}\0{capabilities}\n")
            } else {
                format!("{sha} {ref_name}\n")
            };
            out.extend_from_slice(&pkt::pkt_line(Some(line.as_bytes())));
        }
    }

    out.extend_from_slice(&pkt::pkt_line(None));
    out
}

/// Negotiation state parsed from an upload-pack request body.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct UploadPackRequest {
    pub wants: Vec<String>,
    pub haves: Vec<String>,
    pub done: bool,
}

pub fn parse_upload_pack_request(body: &[u8]) -> UploadPackRequest {
    let mut request = UploadPackRequest::default();
    for line in pkt::parse_pkt_lines(body).into_iter().flatten() {
        let Ok(text) = std::str::from_utf8(line) else {
            continue;
        };
        let text = text.trim();
        if let Some(rest) = text.strip_prefix("want ") {
            if let Some(sha) = rest.split_whitespace().next() {
                request.wants.push(sha.to_owned());
            }
        } else if let Some(rest) = text.strip_prefix("have ") {
            if let Some(sha) = rest.split_whitespace().next() {
                request.haves.push(sha.to_owned());
            }
        } else if text == "done" {
            request.done = true;
            break;
        }
    }
    request
}

/// Full upload-pack response: `NAK`, then the pack on side-band 1 in
/// bounded chunks, then a flush.
pub fn upload_pack_response(pack: &[u8]) -> Vec<u8> {
    let mut out = pkt::pkt_line(Some(b"NAK\n"));
    out.extend_from_slice(&pkt::side_band_chunks(pkt::BAND_PACK, pack));
    out.extend_from_slice(&pkt::pkt_line(None));
    out
}

/// One ref update command from a receive-pack request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdate {
    pub old_sha: String,
    pub new_sha: String,
    pub ref_name: String,
}

/// Parse the command section of a receive-pack body (the pack that
/// follows the first flush is left untouched).
pub fn parse_receive_pack_commands(body: &[u8]) -> Vec<RefUpdate> {
    let mut commands = Vec::new();
    let mut rest = body;
    while !rest.is_empty() {
        let (line, remaining) = pkt::parse_pkt_line(rest);
        rest = remaining;
        let Some(line) = line else {
            break; // flush ends the command list
        };
        let Ok(text) = std::str::from_utf8(line) else {
            continue;
        };
        let mut parts = text.trim().split_whitespace();
        if let (Some(old_sha), Some(new_sha), Some(ref_name)) =
            (parts.next(), parts.next(), parts.next())
        {
            // Capability list may ride after a NUL on the first command.
            let ref_name = ref_name.split('\0').next().unwrap_or(ref_name);
            commands.push(RefUpdate {
                old_sha: old_sha.to_owned(),
                new_sha: new_sha.to_owned(),
                ref_name: ref_name.to_owned(),
            });
        }
    }
    commands
}

/// Report-status for a push. Pushes are not materialized into the store:
/// the pack unpacks fine but every ref command is refused, pointing the
/// client at the upload API.
pub fn receive_pack_response(commands: &[RefUpdate]) -> Vec<u8> {
    let mut frames: Vec<Vec<u8>> = vec![b"\x01unpack ok\n".to_vec()];
    for command in commands {
        frames.push(
            format!(
                "\x01ng {} push via git is not supported; use the hub upload API\n",
                command.ref_name
            )
            .into_bytes(),
        );
    }

    let mut out = Vec::new();
    for frame in &frames {
        out.extend_from_slice(&pkt::pkt_line(Some(frame)));
    }
    out.extend_from_slice(&pkt::pkt_line(None));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advertisement_has_banner_flush_and_caps() {
        let refs = vec![
            ("HEAD".to_owned(), "a".repeat(40)),
            ("refs/heads/main".to_owned(), "a".repeat(40)),
        ];
        let ad = service_advertisement("git-upload-pack", &refs, "side-band-64k");
        let text = String::from_utf8_lossy(&ad);
        assert!(text.starts_with("001e# service=git-upload-pack\n0000"));
        assert!(text.contains("HEAD\0side-band-64k\n"));
        assert!(text.contains("refs/heads/main\n"));
        assert!(text.ends_with("0000"));
    }

    #[test]
    fn advertisement_for_empty_repo_uses_zero_id() {
        let ad = service_advertisement("git-receive-pack", &[], "report-status");
        let text = String::from_utf8_lossy(&ad);
        assert!(text.contains(&format!("{} capabilities^{{}}\0report-status\n", "0".repeat(40))));
    }

    #[test]
    fn parses_wants_haves_done() {
        let body = pkt::pkt_line_stream(&[
            Some(format!("want {} side-band-64k agent=git/2.40\n", "a".repeat(40)).as_bytes()),
            Some(format!("want {}\n", "b".repeat(40)).as_bytes()),
            None,
            Some(format!("have {}\n", "c".repeat(40)).as_bytes()),
            Some(b"done\n"),
        ]);
        let request = parse_upload_pack_request(&body);
        assert_eq!(request.wants, vec!["a".repeat(40), "b".repeat(40)]);
        assert_eq!(request.haves, vec!["c".repeat(40)]);
        assert!(request.done);
    }

    #[test]
    fn upload_pack_response_starts_with_nak_ends_with_flush() {
        let response = upload_pack_response(&crate::git::objects::empty_pack());
        assert!(response.starts_with(b"0008NAK\n"));
        assert!(response.ends_with(b"0000"));
        // Band-1 frame carrying the pack.
        let lines = pkt::parse_pkt_lines(&response);
        assert_eq!(lines[1].unwrap()[0], pkt::BAND_PACK);
    }

    #[test]
    fn parses_receive_pack_commands_with_capabilities() {
        let command = format!(
            "{} {} refs/heads/main\0report-status side-band-64k",
            "0".repeat(40),
            "a".repeat(40)
        );
        let mut body = pkt::pkt_line(Some(command.as_bytes()));
        body.extend_from_slice(&pkt::pkt_line(None));
        body.extend_from_slice(b"PACK....");

        let commands = parse_receive_pack_commands(&body);
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].ref_name, "refs/heads/main");
        assert_eq!(commands[0].old_sha, "0".repeat(40));
    }

    #[test]
    fn receive_pack_refuses_every_ref() {
        let commands = vec![RefUpdate {
            old_sha: "0".repeat(40),
            new_sha: "a".repeat(40),
            ref_name: "refs/heads/main".to_owned(),
        }];
        let response = receive_pack_response(&commands);
        let text = String::from_utf8_lossy(&response);
        assert!(text.contains("unpack ok\n"));
        assert!(text.contains("ng refs/heads/main"));
        assert!(text.ends_with("0000"));
    }

    #[test]
    fn sha_cache_round_trip() {
        let cache = GitShaCache::default();
        assert!(cache.get("store1").is_none());
        cache.insert("store1".into(), "git1".into());
        assert_eq!(cache.get("store1").as_deref(), Some("git1"));
    }
}
