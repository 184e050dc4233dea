//! In-memory Git object construction: blobs, trees, commits and pack
//! files, all deterministic and without touching disk.

use std::collections::HashMap;
use std::io::Write;

use flate2::Compression;
use flate2::write::ZlibEncoder;
use sha1::{Digest, Sha1};

/// Pack object type codes.
pub const OBJ_COMMIT: u8 = 1;
pub const OBJ_TREE: u8 = 2;
pub const OBJ_BLOB: u8 = 3;

/// File mode for plain files in tree entries.
pub const MODE_FILE: &str = "100644";
/// Mode for subtrees.
pub const MODE_TREE: &str = "40000";

/// A Git object: its type code and full data (`"type len\0"` header plus
/// content). The SHA-1 is computed over exactly these bytes.
#[derive(Debug, Clone)]
pub struct GitObject {
    pub kind: u8,
    pub data: Vec<u8>,
}

impl GitObject {
    pub fn sha1_hex(&self) -> String {
        hex::encode(Sha1::digest(&self.data))
    }

    /// Content without the `type len\0` header.
    fn content(&self) -> &[u8] {
        match self.data.iter().position(|&b| b == 0) {
            Some(pos) => &self.data[pos + 1..],
            None => &self.data,
        }
    }
}

/// The exact pointer text Git LFS clients expect for a large file.
pub fn lfs_pointer(oid: &str, size: i64) -> Vec<u8> {
    format!("version https://git-lfs.github.com/spec/v1\noid sha256:{oid}\nsize {size}\n")
        .into_bytes()
}

pub fn blob_object(content: &[u8]) -> GitObject {
    let mut data = format!("blob {}\0", content.len()).into_bytes();
    data.extend_from_slice(content);
    GitObject {
        kind: OBJ_BLOB,
        data,
    }
}

/// One tree entry: `(mode, name, sha1_hex)`.
pub type TreeEntry = (String, String, String);

/// Git's tree ordering: directory names compare as if suffixed with "/".
/// Getting this wrong changes every tree SHA above it.
fn tree_sort_key(entry: &TreeEntry) -> String {
    let (mode, name, _) = entry;
    if mode == MODE_TREE || mode == "040000" {
        format!("{name}/")
    } else {
        name.clone()
    }
}

pub fn tree_object(mut entries: Vec<TreeEntry>) -> GitObject {
    entries.sort_by_key(tree_sort_key);

    let mut content = Vec::new();
    for (mode, name, sha1_hex) in &entries {
        content.extend_from_slice(format!("{mode} {name}\0").as_bytes());
        content.extend_from_slice(&hex::decode(sha1_hex).unwrap_or_default());
    }

    let mut data = format!("tree {}\0", content.len()).into_bytes();
    data.extend_from_slice(&content);
    GitObject {
        kind: OBJ_TREE,
        data,
    }
}

pub struct CommitIdentity<'a> {
    pub name: &'a str,
    pub email: &'a str,
}

pub fn commit_object(
    tree_sha1: &str,
    parents: &[String],
    identity: &CommitIdentity<'_>,
    timestamp: i64,
    message: &str,
) -> GitObject {
    let mut lines = vec![format!("tree {tree_sha1}")];
    for parent in parents {
        lines.push(format!("parent {parent}"));
    }
    let person = format!("{} <{}> {timestamp} +0000", identity.name, identity.email);
    lines.push(format!("author {person}"));
    lines.push(format!("committer {person}"));
    lines.push(String::new());
    lines.push(message.to_owned());

    let content = lines.join("\n").into_bytes();
    let mut data = format!("commit {}\0", content.len()).into_bytes();
    data.extend_from_slice(&content);
    GitObject {
        kind: OBJ_COMMIT,
        data,
    }
}

/// Variable-length pack entry header: low 4 size bits share the first
/// byte with the 3-bit type; later bytes carry 7 bits each, MSB set while
/// more follow.
pub fn pack_object_header(kind: u8, mut size: usize) -> Vec<u8> {
    let mut first = (kind << 4) | u8::try_from(size & 0x0F).expect("masked");
    size >>= 4;

    let mut out = Vec::new();
    if size > 0 {
        first |= 0x80;
        out.push(first);
        while size > 0 {
            let mut byte = u8::try_from(size & 0x7F).expect("masked");
            size >>= 7;
            if size > 0 {
                byte |= 0x80;
            }
            out.push(byte);
        }
    } else {
        out.push(first);
    }
    out
}

/// Assemble a version-2 pack: header, zlib-compressed entries, SHA-1
/// trailer over everything before it.
pub fn pack_file(objects: &[GitObject]) -> Vec<u8> {
    let mut pack = b"PACK".to_vec();
    pack.extend_from_slice(&2u32.to_be_bytes());
    pack.extend_from_slice(&u32::try_from(objects.len()).unwrap_or(u32::MAX).to_be_bytes());

    for object in objects {
        let content = object.content();
        pack.extend_from_slice(&pack_object_header(object.kind, content.len()));

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(content).expect("in-memory zlib write");
        pack.extend_from_slice(&encoder.finish().expect("in-memory zlib finish"));
    }

    let checksum = Sha1::digest(&pack);
    pack.extend_from_slice(&checksum);
    pack
}

pub fn empty_pack() -> Vec<u8> {
    pack_file(&[])
}

/// Build the nested tree objects for a flat file list.
///
/// `files` are `(path, blob_sha1)` pairs with `/`-separated paths.
/// Returns the root tree SHA-1 plus every tree object, children emitted
/// before their parents.
pub fn build_nested_trees(files: &[(String, String)]) -> (String, Vec<GitObject>) {
    // dir path ("" = root) → entries of files directly inside it
    let mut dir_files: HashMap<String, Vec<TreeEntry>> = HashMap::new();
    dir_files.entry(String::new()).or_default();

    for (path, blob_sha1) in files {
        let (dir, file_name) = match path.rsplit_once('/') {
            Some((dir, file_name)) => (dir.to_owned(), file_name),
            None => (String::new(), path.as_str()),
        };

        // Register every ancestor directory.
        let parts: Vec<&str> = path.split('/').collect();
        for depth in 1..parts.len() {
            dir_files.entry(parts[..depth].join("/")).or_default();
        }

        dir_files.entry(dir).or_default().push((
            MODE_FILE.to_owned(),
            file_name.to_owned(),
            blob_sha1.clone(),
        ));
    }

    // Deepest directories first, root last, deterministic within a depth.
    let mut dirs: Vec<String> = dir_files.keys().cloned().collect();
    dirs.sort_by(|a, b| {
        let depth = |d: &String| if d.is_empty() { 0 } else { d.matches('/').count() + 1 };
        depth(b).cmp(&depth(a)).then_with(|| a.cmp(b))
    });

    let mut tree_shas: HashMap<String, String> = HashMap::new();
    let mut objects = Vec::new();

    for dir in dirs {
        let mut entries = dir_files.remove(&dir).unwrap_or_default();

        // Direct child subtrees (already built because of depth order).
        for (child_dir, child_sha) in &tree_shas {
            let relative = if dir.is_empty() {
                child_dir.as_str()
            } else {
                match child_dir.strip_prefix(&format!("{dir}/")) {
                    Some(relative) => relative,
                    None => continue,
                }
            };
            if !relative.is_empty() && !relative.contains('/') {
                entries.push((MODE_TREE.to_owned(), relative.to_owned(), child_sha.clone()));
            }
        }

        let tree = tree_object(entries);
        tree_shas.insert(dir, tree.sha1_hex());
        objects.push(tree);
    }

    let root = tree_shas.remove("").unwrap_or_default();
    (root, objects)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_blob_matches_git() {
        assert_eq!(
            blob_object(b"").sha1_hex(),
            "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391"
        );
    }

    #[test]
    fn blob_sha_matches_git_hash_object() {
        // `echo 'test content' | git hash-object --stdin`
        assert_eq!(
            blob_object(b"test content\n").sha1_hex(),
            "d670460b4b4aece5915caf5c68d12f560a9fe3e4"
        );
    }

    #[test]
    fn empty_tree_matches_git() {
        assert_eq!(
            tree_object(vec![]).sha1_hex(),
            "4b825dc642cb6eb9a060e54bf8d69288fbee4904"
        );
    }

    #[test]
    fn tree_sorts_directories_with_trailing_slash() {
        let blob = blob_object(b"x").sha1_hex();
        // "foo" as a dir sorts after "foo.txt" (because "foo/" > "foo.txt")
        let tree = tree_object(vec![
            (MODE_TREE.into(), "foo".into(), blob.clone()),
            (MODE_FILE.into(), "foo.txt".into(), blob.clone()),
        ]);
        let content = &tree.data[tree.data.iter().position(|&b| b == 0).unwrap() + 1..];
        let first_name_end = content.iter().position(|&b| b == 0).unwrap();
        let first = std::str::from_utf8(&content[..first_name_end]).unwrap();
        assert_eq!(first, "100644 foo.txt");
    }

    #[test]
    fn lfs_pointer_is_byte_exact() {
        let oid = "aabbccddeeff00112233445566778899aabbccddeeff00112233445566778899";
        let pointer = lfs_pointer(oid, 10_485_760);
        assert_eq!(
            String::from_utf8(pointer.clone()).unwrap(),
            format!("version https://git-lfs.github.com/spec/v1\noid sha256:{oid}\nsize 10485760\n")
        );
        // The standard pointer size advertised to HF clients.
        assert_eq!(pointer.len(), 134);
    }

    #[test]
    fn commit_object_layout() {
        let identity = CommitIdentity {
            name: "KohakuHub",
            email: "noreply@kohakuhub.local",
        };
        let commit = commit_object(
            "4b825dc642cb6eb9a060e54bf8d69288fbee4904",
            &["abc123".into()],
            &identity,
            1_700_000_000,
            "update weights",
        );
        let text = String::from_utf8(commit.content().to_vec()).unwrap();
        assert!(text.starts_with("tree 4b825dc642cb6eb9a060e54bf8d69288fbee4904\n"));
        assert!(text.contains("parent abc123\n"));
        assert!(text.contains("author KohakuHub <noreply@kohakuhub.local> 1700000000 +0000\n"));
        assert!(text.ends_with("\nupdate weights"));
    }

    #[test]
    fn pack_header_small_size_single_byte() {
        // size 5 blob: 0b0011_0101
        assert_eq!(pack_object_header(OBJ_BLOB, 5), vec![0b0011_0101]);
    }

    #[test]
    fn pack_header_multi_byte_continuation() {
        let header = pack_object_header(OBJ_BLOB, 1 << 12);
        assert!(header.len() > 1);
        assert!(header[0] & 0x80 != 0);
        assert!(header.last().unwrap() & 0x80 == 0);
        // Decode back: low 4 bits + 7 bits per continuation byte.
        let mut size = usize::from(header[0] & 0x0F);
        let mut shift = 4;
        for byte in &header[1..] {
            size |= usize::from(byte & 0x7F) << shift;
            shift += 7;
        }
        assert_eq!(size, 1 << 12);
    }

    #[test]
    fn pack_file_shape_and_trailer() {
        let objects = vec![blob_object(b"hello")];
        let pack = pack_file(&objects);
        assert_eq!(&pack[..4], b"PACK");
        assert_eq!(u32::from_be_bytes(pack[4..8].try_into().unwrap()), 2);
        assert_eq!(u32::from_be_bytes(pack[8..12].try_into().unwrap()), 1);

        let body_len = pack.len() - 20;
        let expected = Sha1::digest(&pack[..body_len]);
        assert_eq!(&pack[body_len..], expected.as_slice());
    }

    #[test]
    fn empty_pack_is_32_bytes() {
        // 12-byte header + 20-byte trailer
        assert_eq!(empty_pack().len(), 32);
    }

    #[test]
    fn nested_trees_cover_all_directories() {
        let blob = blob_object(b"x").sha1_hex();
        let files = vec![
            ("README.md".to_owned(), blob.clone()),
            ("models/config.json".to_owned(), blob.clone()),
            ("models/weights/part-0.bin".to_owned(), blob.clone()),
        ];
        let (root, objects) = build_nested_trees(&files);
        assert_eq!(root.len(), 40);
        // Root, models/, models/weights/
        assert_eq!(objects.len(), 3);
        // The root tree is emitted last (children first).
        assert_eq!(objects.last().unwrap().sha1_hex(), root);
    }

    #[test]
    fn nested_trees_are_deterministic() {
        let blob = blob_object(b"x").sha1_hex();
        let mut files = vec![
            ("b/two.txt".to_owned(), blob.clone()),
            ("a/one.txt".to_owned(), blob.clone()),
            ("top.txt".to_owned(), blob.clone()),
        ];
        let (root1, _) = build_nested_trees(&files);
        files.reverse();
        let (root2, _) = build_nested_trees(&files);
        assert_eq!(root1, root2);
    }

    #[test]
    fn root_only_listing_produces_single_tree() {
        let blob = blob_object(b"x").sha1_hex();
        let (root, objects) = build_nested_trees(&[("a.txt".to_owned(), blob)]);
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].sha1_hex(), root);
    }
}
