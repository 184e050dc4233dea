//! End-to-end checks of synthesized Git data: a pack built for a branch
//! snapshot must parse back into a commit whose tree lists exactly the
//! snapshot's files, with LFS entries replaced by pointer blobs.

use std::collections::HashMap;

use flate2::{Decompress, FlushDecompress};
use sha1::{Digest, Sha1};

use kohakuhub::git::objects::{
    self, CommitIdentity, GitObject, OBJ_BLOB, OBJ_COMMIT, OBJ_TREE, build_nested_trees,
    lfs_pointer, pack_file,
};

/// Minimal pack reader used only by tests.
struct ParsedObject {
    kind: u8,
    content: Vec<u8>,
}

fn parse_pack(pack: &[u8]) -> Vec<ParsedObject> {
    assert_eq!(&pack[..4], b"PACK");
    assert_eq!(u32::from_be_bytes(pack[4..8].try_into().unwrap()), 2);
    let count = u32::from_be_bytes(pack[8..12].try_into().unwrap()) as usize;

    // Trailer integrity first.
    let body_len = pack.len() - 20;
    let expected: [u8; 20] = Sha1::digest(&pack[..body_len]).into();
    assert_eq!(&pack[body_len..], expected);

    let mut objects = Vec::with_capacity(count);
    let mut offset = 12usize;

    for _ in 0..count {
        // Variable-length type+size header.
        let mut byte = pack[offset];
        offset += 1;
        let kind = (byte >> 4) & 0x07;
        let mut size = usize::from(byte & 0x0F);
        let mut shift = 4;
        while byte & 0x80 != 0 {
            byte = pack[offset];
            offset += 1;
            size |= usize::from(byte & 0x7F) << shift;
            shift += 7;
        }

        // One zlib stream per object; track how much input it consumed.
        let mut decompress = Decompress::new(true);
        let mut content = Vec::with_capacity(size);
        decompress
            .decompress_vec(&pack[offset..body_len], &mut content, FlushDecompress::Finish)
            .expect("zlib stream");
        assert_eq!(content.len(), size, "decompressed size matches header");
        offset += usize::try_from(decompress.total_in()).unwrap();

        objects.push(ParsedObject { kind, content });
    }

    assert_eq!(offset, body_len, "pack has no trailing garbage");
    objects
}

fn object_sha(kind: u8, content: &[u8]) -> String {
    let name = match kind {
        OBJ_COMMIT => "commit",
        OBJ_TREE => "tree",
        OBJ_BLOB => "blob",
        other => panic!("unexpected object type {other}"),
    };
    let mut data = format!("{name} {}\0", content.len()).into_bytes();
    data.extend_from_slice(content);
    hex::encode(Sha1::digest(&data))
}

/// Walk a tree object graph, returning `path → blob sha` for all files.
fn walk_tree(
    tree_sha: &str,
    prefix: &str,
    by_sha: &HashMap<String, &ParsedObject>,
    out: &mut HashMap<String, String>,
) {
    let tree = by_sha.get(tree_sha).expect("tree object present in pack");
    assert_eq!(tree.kind, OBJ_TREE);

    let mut rest = tree.content.as_slice();
    while !rest.is_empty() {
        let nul = rest.iter().position(|&b| b == 0).expect("entry header");
        let header = std::str::from_utf8(&rest[..nul]).unwrap();
        let (mode, name) = header.split_once(' ').unwrap();
        let sha = hex::encode(&rest[nul + 1..nul + 21]);
        rest = &rest[nul + 21..];

        let path = if prefix.is_empty() {
            name.to_owned()
        } else {
            format!("{prefix}/{name}")
        };
        if mode == "40000" {
            walk_tree(&sha, &path, by_sha, out);
        } else {
            out.insert(path, sha);
        }
    }
}

struct SnapshotFile {
    path: &'static str,
    content: Vec<u8>,
}

fn build_snapshot_pack(files: &[SnapshotFile]) -> (String, Vec<u8>) {
    let mut all_objects: Vec<GitObject> = Vec::new();
    let mut blob_refs = Vec::new();

    for file in files {
        let blob = objects::blob_object(&file.content);
        blob_refs.push((file.path.to_owned(), blob.sha1_hex()));
        all_objects.push(blob);
    }

    let (root, trees) = build_nested_trees(&blob_refs);
    all_objects.extend(trees);

    let commit = objects::commit_object(
        &root,
        &[],
        &CommitIdentity {
            name: "KohakuHub",
            email: "noreply@kohakuhub.local",
        },
        1_700_000_000,
        "sync branch",
    );
    let commit_sha = commit.sha1_hex();
    all_objects.push(commit);

    (commit_sha, pack_file(&all_objects))
}

#[test]
fn pack_round_trips_to_the_same_file_listing() {
    let oid = "aa".repeat(32);
    let files = vec![
        SnapshotFile {
            path: "README.md",
            content: b"# demo\n".to_vec(),
        },
        SnapshotFile {
            path: "config.json",
            content: b"{}\n".to_vec(),
        },
        SnapshotFile {
            path: "weights/model.safetensors",
            content: lfs_pointer(&oid, 10_485_760),
        },
        SnapshotFile {
            path: "weights/shards/part-00.bin",
            content: lfs_pointer(&oid, 4096),
        },
    ];

    let (commit_sha, pack) = build_snapshot_pack(&files);
    let parsed = parse_pack(&pack);

    // 4 blobs + 3 trees (root, weights, weights/shards) + 1 commit.
    assert_eq!(parsed.len(), 8);

    let by_sha: HashMap<String, &ParsedObject> = parsed
        .iter()
        .map(|object| (object_sha(object.kind, &object.content), object))
        .collect();

    // The advertised commit is in the pack and points at a tree.
    let commit = by_sha.get(&commit_sha).expect("commit in pack");
    assert_eq!(commit.kind, OBJ_COMMIT);
    let commit_text = String::from_utf8(commit.content.clone()).unwrap();
    let tree_sha = commit_text
        .lines()
        .find_map(|line| line.strip_prefix("tree "))
        .expect("tree line");

    let mut listed = HashMap::new();
    walk_tree(tree_sha, "", &by_sha, &mut listed);

    // Exactly the snapshot's files, no more, no less.
    let expected: Vec<&str> = files.iter().map(|f| f.path).collect();
    let mut actual: Vec<&str> = listed.keys().map(String::as_str).collect();
    actual.sort_unstable();
    let mut expected_sorted = expected.clone();
    expected_sorted.sort_unstable();
    assert_eq!(actual, expected_sorted);

    // LFS entries resolve to pointer blobs with the declared oid.
    let pointer_sha = &listed["weights/model.safetensors"];
    let pointer = by_sha.get(pointer_sha).unwrap();
    let pointer_text = String::from_utf8(pointer.content.clone()).unwrap();
    assert!(pointer_text.starts_with("version https://git-lfs.github.com/spec/v1\n"));
    assert!(pointer_text.contains(&format!("oid sha256:{oid}\n")));
    assert!(pointer_text.ends_with("size 10485760\n"));
}

#[test]
fn identical_snapshots_build_identical_packs() {
    let files = || {
        vec![
            SnapshotFile {
                path: "a.txt",
                content: b"one\n".to_vec(),
            },
            SnapshotFile {
                path: "dir/b.txt",
                content: b"two\n".to_vec(),
            },
        ]
    };
    let (sha1, pack1) = build_snapshot_pack(&files());
    let (sha2, pack2) = build_snapshot_pack(&files());
    assert_eq!(sha1, sha2);
    assert_eq!(pack1, pack2);
}

#[test]
fn empty_snapshot_still_produces_valid_pack() {
    let (_, pack) = build_snapshot_pack(&[]);
    let parsed = parse_pack(&pack);
    // Empty root tree + commit.
    assert_eq!(parsed.len(), 2);
}
