use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use crate::blob::{read_blob_file, BlobFrameIter};
use crate::feature::FeatureVec;
use crate::remote_file::FileSystem;
use crate::util;

/// Streams one shard's `(input, features)` pairs to `callback`.
///
/// The features file is read fully first, building a map from input hash
/// to feature vector; the corpus file is then streamed record by record
/// and joined against that map. An input whose hash is absent from the
/// map gets an empty feature vector, which tells the caller to re-execute
/// it.
///
/// Both files may be missing, empty, or end mid-frame (a peer mid-append)
/// -- all of that is absorbed; only genuine I/O failures are errors.
pub fn read_shard<F>(
    fs: &Arc<dyn FileSystem>,
    corpus_path: &Path,
    features_path: &Path,
    mut callback: F,
) -> io::Result<()>
where
    F: FnMut(Vec<u8>, FeatureVec),
{
    let features_buf = read_blob_file(fs, features_path)?;
    let mut hash_to_features: HashMap<String, FeatureVec> = HashMap::new();
    for blob in BlobFrameIter::new(&features_buf) {
        if let Some((features, input_hash)) = util::unpack_features_and_hash(blob.data) {
            hash_to_features.insert(input_hash, features);
        }
    }

    let corpus_buf = read_blob_file(fs, corpus_path)?;
    for blob in BlobFrameIter::new(&corpus_buf) {
        let features = hash_to_features.remove(&blob.hash).unwrap_or_default();
        callback(blob.data.to_vec(), features);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::BlobFileAppender;
    use crate::remote_file::LocalFileSystem;
    use tempfile::tempdir;

    fn write_corpus(fs: &Arc<dyn FileSystem>, path: &Path, inputs: &[&[u8]]) {
        let mut appender = BlobFileAppender::open(fs, path).unwrap();
        for input in inputs {
            appender.append(input).unwrap();
        }
        appender.close().unwrap();
    }

    fn write_features(fs: &Arc<dyn FileSystem>, path: &Path, entries: &[(&[u8], Vec<u64>)]) {
        let mut appender = BlobFileAppender::open(fs, path).unwrap();
        for (input, features) in entries {
            appender
                .append(&util::pack_features_and_hash(input, features))
                .unwrap();
        }
        appender.close().unwrap();
    }

    #[test]
    fn joins_inputs_with_their_features() {
        let dir = tempdir().unwrap();
        let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem);
        let corpus_path = dir.path().join("corpus.0");
        let features_path = dir.path().join("features.0");

        write_corpus(&fs, &corpus_path, &[b"aaa", b"bbb"]);
        write_features(
            &fs,
            &features_path,
            &[(b"aaa", vec![1, 2]), (b"bbb", vec![3])],
        );

        let mut seen = Vec::new();
        read_shard(&fs, &corpus_path, &features_path, |input, features| {
            seen.push((input, features));
        })
        .unwrap();
        assert_eq!(
            seen,
            vec![
                (b"aaa".to_vec(), vec![1, 2]),
                (b"bbb".to_vec(), vec![3]),
            ]
        );
    }

    #[test]
    fn inputs_without_features_get_empty_vectors() {
        let dir = tempdir().unwrap();
        let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem);
        let corpus_path = dir.path().join("corpus.0");
        let features_path = dir.path().join("features.0");

        write_corpus(&fs, &corpus_path, &[b"known", b"unknown"]);
        write_features(&fs, &features_path, &[(b"known", vec![9])]);

        let mut seen = Vec::new();
        read_shard(&fs, &corpus_path, &features_path, |input, features| {
            seen.push((input, features));
        })
        .unwrap();
        assert_eq!(seen[0], (b"known".to_vec(), vec![9]));
        assert_eq!(seen[1], (b"unknown".to_vec(), Vec::new()));
    }

    #[test]
    fn missing_files_yield_no_callbacks() {
        let dir = tempdir().unwrap();
        let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem);
        let mut calls = 0;
        read_shard(
            &fs,
            &dir.path().join("no-corpus"),
            &dir.path().join("no-features"),
            |_, _| calls += 1,
        )
        .unwrap();
        assert_eq!(calls, 0);
    }

    #[test]
    fn truncated_corpus_file_is_absorbed() {
        let dir = tempdir().unwrap();
        let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem);
        let corpus_path = dir.path().join("corpus.0");
        let features_path = dir.path().join("features.0");

        write_corpus(&fs, &corpus_path, &[b"one", b"two"]);
        // Chop the tail: the second record becomes a partial frame.
        let full = std::fs::read(&corpus_path).unwrap();
        std::fs::write(&corpus_path, &full[..full.len() - 5]).unwrap();

        let mut seen = Vec::new();
        read_shard(&fs, &corpus_path, &features_path, |input, _| {
            seen.push(input);
        })
        .unwrap();
        assert_eq!(seen, vec![b"one".to_vec()]);
    }
}
