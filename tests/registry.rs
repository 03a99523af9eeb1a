//! Implementation selection during program builds.

mod common;

use common::*;
use graphforge::ir::{RecurrentActivation, RecurrentDirection};
use graphforge::program::{LstmWeightsOrder, Primitive, PrimitiveKind, ProgramBuilder};
use graphforge::rewrite::passes::ConvertConvolutionToCompressed;
use graphforge::rewrite::GraphPass;
use graphforge::{CompileConfig, GraphForgeError, ImplementationRegistry};

fn lstm_implementation(device: graphforge::DeviceInfo, clip: f32) -> (String, usize) {
    let registry = ImplementationRegistry::with_defaults();
    let config = CompileConfig::new().with_device(device);
    let graph = LstmFixture::new(RecurrentDirection::Forward).with_clip(clip).graph();
    let program = ProgramBuilder::new(&registry, &config).build(&graph).unwrap();
    let lstm = program.instances_of(PrimitiveKind::LstmSeq).next().unwrap();
    (lstm.implementation.clone(), program.stats().reorders_inserted)
}

#[test]
fn test_clip_falls_back_to_reference_lstm() {
    init_test_logging();
    let (implementation, reorders) = lstm_implementation(immad_device(), 0.5);
    assert_eq!(implementation, "ocl::lstm_seq_ref");
    assert_eq!(reorders, 0);
}

#[test]
fn test_immad_device_selects_onednn_lstm() {
    init_test_logging();
    let (implementation, reorders) = lstm_implementation(immad_device(), 0.0);
    assert_eq!(implementation, "onednn::lstm_seq");
    assert!(reorders > 0);
}

#[test]
fn test_non_default_activations_fall_back_to_reference_lstm() {
    let registry = ImplementationRegistry::with_defaults();
    let config = CompileConfig::new().with_device(immad_device());
    for activations in [
        vec![RecurrentActivation::Relu; 3],
        vec![RecurrentActivation::Sigmoid, RecurrentActivation::Relu, RecurrentActivation::Tanh],
    ] {
        let graph = LstmFixture::new(RecurrentDirection::Forward)
            .with_activations(activations)
            .graph();
        let program = ProgramBuilder::new(&registry, &config).build(&graph).unwrap();
        let lstm = program.instances_of(PrimitiveKind::LstmSeq).next().unwrap();
        assert_eq!(lstm.implementation, "ocl::lstm_seq_ref");
        assert_eq!(program.stats().reorders_inserted, 0);
    }
}

#[test]
fn test_reference_device_never_selects_onednn() {
    let (implementation, _) = lstm_implementation(reference_device(), 0.0);
    assert_eq!(implementation, "ocl::lstm_seq_ref");
}

#[test]
fn test_onednn_lstm_consumes_izof_weights() {
    let registry = ImplementationRegistry::with_defaults();
    let config = CompileConfig::new().with_device(immad_device());
    let graph = LstmFixture::new(RecurrentDirection::Forward).graph();
    let program = ProgramBuilder::new(&registry, &config).build(&graph).unwrap();
    let lstm = program.instances_of(PrimitiveKind::LstmSeq).next().unwrap();
    match &lstm.primitive {
        Primitive::LstmSeq { order, .. } => assert_eq!(*order, LstmWeightsOrder::Izof),
        other => panic!("unexpected primitive {:?}", other),
    }
}

#[test]
fn test_compressed_convolution_on_immad_device() {
    let mut graph = dequantized_conv_graph();
    ConvertConvolutionToCompressed::new()
        .run_on_graph(&mut graph)
        .unwrap();
    let registry = ImplementationRegistry::with_defaults();

    let config = CompileConfig::new().with_device(immad_device());
    let program = ProgramBuilder::new(&registry, &config).build(&graph).unwrap();
    let conv = program.instances_of(PrimitiveKind::Convolution).next().unwrap();
    assert_eq!(conv.implementation, "onednn::convolution");

    let config = CompileConfig::new().with_device(reference_device());
    let program = ProgramBuilder::new(&registry, &config).build(&graph).unwrap();
    let conv = program.instances_of(PrimitiveKind::Convolution).next().unwrap();
    assert_eq!(conv.implementation, "ocl::convolution_ref");
}

#[test]
fn test_empty_registry_reports_missing_implementation() {
    let registry = ImplementationRegistry::new();
    let config = CompileConfig::new();
    let err = ProgramBuilder::new(&registry, &config)
        .build(&elementwise_graph())
        .unwrap_err();
    assert!(matches!(err, GraphForgeError::NoImplementation { .. }));
}

#[test]
fn test_every_instance_has_a_kernel_blob() {
    let registry = ImplementationRegistry::with_defaults();
    let config = CompileConfig::new().with_device(immad_device());
    let graph = LstmFixture::new(RecurrentDirection::Bidirectional).graph();
    let program = ProgramBuilder::new(&registry, &config).build(&graph).unwrap();
    for instance in program.instances() {
        assert!(!instance.kernel_blob.is_empty(), "{}", instance.id);
        assert!(registry.find(&instance.implementation).is_some());
    }
}
