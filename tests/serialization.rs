//! Program serialization and the on-disk cache.

mod common;

use common::*;
use graphforge::ir::RecurrentDirection;
use graphforge::program::ProgramBuilder;
use graphforge::rewrite::passes::ConvertConvolutionToCompressed;
use graphforge::rewrite::GraphPass;
use graphforge::serialize::{self, ProgramCache};
use graphforge::{CompileConfig, ErrorCategory, GraphForgeError, ImplementationRegistry, Program};

fn to_bytes(program: &Program) -> Vec<u8> {
    let mut blob = Vec::new();
    serialize::serialize(program, &mut blob).unwrap();
    blob
}

fn is_mismatch(err: &GraphForgeError) -> bool {
    matches!(err, GraphForgeError::CacheMismatch(_))
}

#[test]
fn test_round_trip_is_bit_identical() {
    init_test_logging();
    let registry = ImplementationRegistry::with_defaults();
    let mut conv = dequantized_conv_graph();
    ConvertConvolutionToCompressed::new()
        .run_on_graph(&mut conv)
        .unwrap();
    let graphs = [
        elementwise_graph(),
        conv,
        LstmFixture::new(RecurrentDirection::Bidirectional).graph(),
    ];
    for device in [reference_device(), immad_device()] {
        let config = CompileConfig::new().with_device(device);
        for graph in &graphs {
            let program = ProgramBuilder::new(&registry, &config).build(graph).unwrap();
            let blob = to_bytes(&program);
            let loaded = serialize::deserialize(blob.as_slice(), &registry, &config).unwrap();
            assert_eq!(to_bytes(&loaded), blob);

            assert_eq!(loaded.instances().len(), program.instances().len());
            for (a, b) in loaded.instances().iter().zip(program.instances()) {
                assert_eq!(a.id, b.id);
                assert_eq!(a.implementation, b.implementation);
                assert_eq!(a.kernel_blob, b.kernel_blob);
            }
            assert_eq!(loaded.stats().primitives, program.stats().primitives);
            assert_eq!(loaded.estimated_device_mem_usage(), program.estimated_device_mem_usage());
        }
    }
}

#[test]
fn test_loaded_program_executes_identically() {
    let registry = ImplementationRegistry::with_defaults();
    let config = CompileConfig::new().with_device(immad_device());
    let graph = LstmFixture::new(RecurrentDirection::Reverse).graph();
    let program = ProgramBuilder::new(&registry, &config).build(&graph).unwrap();
    let loaded = serialize::deserialize(to_bytes(&program).as_slice(), &registry, &config).unwrap();

    let inputs = inputs_for(&graph, 2);
    let expected = program.execute(&inputs).unwrap();
    let actual = loaded.execute(&inputs).unwrap();
    for (name, tensor) in &expected {
        assert!(actual[name].bit_equal(tensor), "{}", name);
    }
    // Decisions describe the build, not the blob.
    assert!(!program.reorder_decisions().is_empty());
    assert!(loaded.reorder_decisions().is_empty());
}

#[test]
fn test_device_mismatch_is_rejected() {
    let registry = ImplementationRegistry::with_defaults();
    let config = CompileConfig::new().with_device(reference_device());
    let program = ProgramBuilder::new(&registry, &config)
        .build(&elementwise_graph())
        .unwrap();
    let other = CompileConfig::new().with_device(immad_device());
    let err = serialize::deserialize(to_bytes(&program).as_slice(), &registry, &other).unwrap_err();
    assert!(is_mismatch(&err));
    assert_eq!(err.category(), ErrorCategory::Cache);
}

#[test]
fn test_version_and_magic_are_checked() {
    let registry = ImplementationRegistry::with_defaults();
    let config = CompileConfig::new();
    let program = ProgramBuilder::new(&registry, &config)
        .build(&elementwise_graph())
        .unwrap();
    let blob = to_bytes(&program);

    let mut wrong_version = blob.clone();
    wrong_version[4..8].copy_from_slice(&(serialize::binary::VERSION + 1).to_le_bytes());
    let err = serialize::deserialize(wrong_version.as_slice(), &registry, &config).unwrap_err();
    assert!(is_mismatch(&err));

    let mut wrong_magic = blob.clone();
    wrong_magic[0] ^= 0xff;
    let err = serialize::deserialize(wrong_magic.as_slice(), &registry, &config).unwrap_err();
    assert!(is_mismatch(&err));

    let truncated = &blob[..blob.len() / 2];
    let err = serialize::deserialize(truncated, &registry, &config).unwrap_err();
    assert!(is_mismatch(&err));
}

#[test]
fn test_fingerprint_mismatch_is_rejected() {
    let registry = ImplementationRegistry::with_defaults();
    let config = CompileConfig::new();
    let graph = elementwise_graph();
    let program = ProgramBuilder::new(&registry, &config).build(&graph).unwrap();
    let blob = to_bytes(&program);

    serialize::deserialize_for_graph(blob.as_slice(), &registry, &config, &graph).unwrap();
    let other = LstmFixture::new(RecurrentDirection::Forward).graph();
    let err = serialize::deserialize_for_graph(blob.as_slice(), &registry, &config, &other).unwrap_err();
    assert!(is_mismatch(&err));
}

#[test]
fn test_unknown_implementation_is_rejected() {
    let registry = ImplementationRegistry::with_defaults();
    let config = CompileConfig::new();
    let program = ProgramBuilder::new(&registry, &config)
        .build(&elementwise_graph())
        .unwrap();
    let err = serialize::deserialize(
        to_bytes(&program).as_slice(),
        &ImplementationRegistry::new(),
        &config,
    )
    .unwrap_err();
    assert!(is_mismatch(&err));
}

#[test]
fn test_save_and_load_file() {
    let dir = create_temp_dir().unwrap();
    let path = blob_path(&dir, "elementwise");
    let registry = ImplementationRegistry::with_defaults();
    let config = CompileConfig::new();
    let program = ProgramBuilder::new(&registry, &config)
        .build(&elementwise_graph())
        .unwrap();
    serialize::save_to_file(&program, &path).unwrap();
    let loaded = serialize::load_from_file(&path, &registry, &config).unwrap();
    assert_eq!(to_bytes(&loaded), to_bytes(&program));

    let missing = serialize::load_from_file(blob_path(&dir, "missing"), &registry, &config).unwrap_err();
    assert!(matches!(missing, GraphForgeError::Io(_)));
}

#[test]
#[serial]
fn test_program_cache_hit_and_stale_blob() {
    init_test_logging();
    let dir = create_temp_dir().unwrap();
    let cache = ProgramCache::new(dir.path().join("programs"));
    let registry = ImplementationRegistry::with_defaults();
    let config = CompileConfig::new().with_device(immad_device());
    let graph = LstmFixture::new(RecurrentDirection::Forward).graph();

    assert!(cache.load(&graph, &registry, &config).unwrap().is_none());
    let built = cache.get_or_build(&graph, &registry, &config).unwrap();
    let path = cache.path_for(&graph, &config).unwrap();
    assert!(path.exists());

    let hit = cache.load(&graph, &registry, &config).unwrap().unwrap();
    assert_eq!(to_bytes(&hit), to_bytes(&built));

    // A different configuration never reads this blob.
    let other = config.clone().with_allow_new_shape_infer(false);
    assert_ne!(cache.path_for(&graph, &other).unwrap(), path);

    std::fs::write(&path, b"not a program").unwrap();
    assert!(cache.load(&graph, &registry, &config).unwrap().is_none());
    let rebuilt = cache.get_or_build(&graph, &registry, &config).unwrap();
    assert_eq!(to_bytes(&rebuilt), to_bytes(&built));
}

fn header(config: &CompileConfig) -> Vec<u8> {
    let signature = config.device.signature();
    let mut blob = Vec::new();
    blob.extend_from_slice(&serialize::binary::MAGIC.to_le_bytes());
    blob.extend_from_slice(&serialize::binary::VERSION.to_le_bytes());
    blob.extend_from_slice(&(signature.len() as u64).to_le_bytes());
    blob.extend_from_slice(signature.as_bytes());
    blob
}

#[test]
#[serial]
fn test_corrupt_lengths_are_cache_mismatch() {
    let dir = create_temp_dir().unwrap();
    let cache = ProgramCache::new(dir.path());
    let registry = ImplementationRegistry::with_defaults();
    let config = CompileConfig::new();
    let graph = elementwise_graph();

    // Huge instance count followed by nothing.
    let mut blob = header(&config);
    blob.extend_from_slice(&graph.fingerprint().to_le_bytes());
    blob.extend_from_slice(&0u64.to_le_bytes());
    blob.extend_from_slice(&0u64.to_le_bytes());
    blob.extend_from_slice(&(1u64 << 32).to_le_bytes());
    let err = serialize::deserialize(blob.as_slice(), &registry, &config).unwrap_err();
    assert!(is_mismatch(&err));

    std::fs::write(cache.path_for(&graph, &config).unwrap(), &blob).unwrap();
    assert!(cache.load(&graph, &registry, &config).unwrap().is_none());

    // Device string claiming far more bytes than the blob holds.
    let mut blob = serialize::binary::MAGIC.to_le_bytes().to_vec();
    blob.extend_from_slice(&serialize::binary::VERSION.to_le_bytes());
    blob.extend_from_slice(&(1u64 << 31).to_le_bytes());
    blob.extend_from_slice(b"ref");
    let err = serialize::deserialize(blob.as_slice(), &registry, &config).unwrap_err();
    assert!(is_mismatch(&err));
}

#[test]
#[serial]
fn test_cache_separates_attribute_and_weight_changes() {
    let dir = create_temp_dir().unwrap();
    let cache = ProgramCache::new(dir.path().join("programs"));
    let registry = ImplementationRegistry::with_defaults();
    let config = CompileConfig::new().with_device(immad_device());

    let plain = LstmFixture::new(RecurrentDirection::Forward).graph();
    let clipped = LstmFixture::new(RecurrentDirection::Forward).with_clip(0.5).graph();
    let reweighted = LstmFixture::new(RecurrentDirection::Forward)
        .with_weight_seed(99)
        .graph();

    assert_ne!(plain.fingerprint(), clipped.fingerprint());
    assert_ne!(plain.fingerprint(), reweighted.fingerprint());
    let plain_path = cache.path_for(&plain, &config).unwrap();
    assert_ne!(cache.path_for(&clipped, &config).unwrap(), plain_path);
    assert_ne!(cache.path_for(&reweighted, &config).unwrap(), plain_path);

    let fast = cache.get_or_build(&plain, &registry, &config).unwrap();
    assert!(fast.instances().iter().any(|i| i.implementation == "onednn::lstm_seq"));

    // Clipping is not supported by the oneDNN kernel; the cached plain
    // program must not be served for the clipped graph.
    let slow = cache.get_or_build(&clipped, &registry, &config).unwrap();
    assert!(slow.instances().iter().any(|i| i.implementation == "ocl::lstm_seq_ref"));
    assert!(!slow.instances().iter().any(|i| i.implementation == "onednn::lstm_seq"));

    let blob = to_bytes(&fast);
    for other in [&clipped, &reweighted] {
        let err = serialize::deserialize_for_graph(blob.as_slice(), &registry, &config, other).unwrap_err();
        assert!(is_mismatch(&err));
    }
}
