use convkit::backend::Engine;
use convkit::error::KernelError;
use convkit::layer::Conv2dLayer;
use convkit::ops::dispatch::{Device, Dispatcher};
use convkit::padding::Conv2dPadding;
use convkit::params::{ConnectionTable, ConvParams, Padding};
use convkit::tensors::Tensor;
use convkit::{OpKernelContext, tensor};
use std::sync::Arc;

fn params() -> Arc<ConvParams> {
    Arc::new(ConvParams::builder(4, 4, 1).kernel(3, 3).build().unwrap())
}

#[test]
fn test_unsupported_engine_at_binding() {
    let err = Dispatcher::cpu().conv2d(Engine::Opencl, params()).unwrap_err();
    assert!(matches!(err, KernelError::UnsupportedEngine { engine: Engine::Opencl, .. }));
}

#[test]
fn test_libdnn_requires_a_gpu_device() {
    for dispatcher in [Dispatcher::cpu(), Dispatcher::with_device(Device::Cpu)] {
        let err = dispatcher.conv2d(Engine::Libdnn, params()).unwrap_err();
        assert!(matches!(
            err,
            KernelError::UnsupportedConfiguration(_) | KernelError::UnsupportedEngine { .. }
        ));
    }
}

#[test]
fn test_even_kernel_with_same_padding() {
    let err = ConvParams::builder(8, 8, 1)
        .kernel(4, 4)
        .padding(Padding::Same)
        .build()
        .unwrap_err();
    assert!(matches!(err, KernelError::UnsupportedConfiguration(_)));
    assert!(ConvParams::builder(8, 8, 1).kernel(4, 4).build().is_ok());
}

#[test]
fn test_invalid_params() {
    assert!(matches!(
        ConvParams::builder(4, 4, 0).kernel(3, 3).build(),
        Err(KernelError::InvalidParams(_))
    ));
    assert!(matches!(
        ConvParams::builder(4, 4, 1).kernel(5, 5).build(),
        Err(KernelError::InvalidParams(_))
    ));
    assert!(matches!(
        ConvParams::builder(4, 4, 1).kernel(3, 3).dilation(2, 2).build(),
        Err(KernelError::UnsupportedConfiguration(_))
    ));
    let table = ConnectionTable::from_matrix(&[true, true], 1, 2).unwrap();
    assert!(matches!(
        ConvParams::builder(4, 4, 2).kernel(3, 3).table(table).build(),
        Err(KernelError::InvalidParams(_))
    ));
}

#[test]
fn test_nnpack_backward_is_not_implemented() {
    let params = ConvParams::builder(4, 4, 1).kernel(3, 3).build().unwrap();
    let mut layer = Conv2dLayer::with_dispatcher(params, Dispatcher::cpu(), Engine::Nnpack).unwrap();
    let x = Tensor::filled(1, 16, 1.0);
    let w = Tensor::filled(1, 9, 1.0);
    let b = Tensor::zeros(1, 1);
    assert!(layer.forward(&x, &w, &b).is_ok());

    let err = layer.backward(&x, &w, &b, &Tensor::filled(1, 4, 1.0)).unwrap_err();
    assert!(matches!(err, KernelError::NotImplemented { engine: Engine::Nnpack, .. }));
    assert_eq!(err.to_string(), "conv2d backward is not implemented for engine NNPACK");
}

#[test]
fn test_shape_mismatch_leaves_outputs_untouched() {
    let kernels = Dispatcher::cpu().conv2d(Engine::Internal, params()).unwrap();
    let x = Tensor::filled(2, 16, 1.0);
    let w = Tensor::filled(1, 9, 1.0);
    let b = Tensor::zeros(1, 1);

    // one delta sample for a batch of two
    let delta = Tensor::filled(1, 4, 1.0);
    let (mut pd, mut dw, mut db) = (Tensor::filled(2, 16, 7.0), Tensor::default(), Tensor::default());
    let mut ctx = OpKernelContext::backward(vec![&x, &w, &b], vec![&delta], vec![&mut pd, &mut dw, &mut db])
        .with_engine(Engine::Internal);
    let err = kernels.backward.compute(&mut ctx).unwrap_err();
    assert!(matches!(
        err,
        KernelError::ShapeMismatch { what: "output delta", expected: 2, actual: 1 }
    ));
    assert_eq!(pd, Tensor::filled(2, 16, 7.0));

    // bias of the wrong length
    let mut out = tensor![[1.0]];
    let bad_bias = Tensor::zeros(1, 2);
    let mut ctx = OpKernelContext::forward(vec![&x, &w, &bad_bias], vec![&mut out]).with_engine(Engine::Internal);
    assert!(kernels.forward.compute(&mut ctx).is_err());
    assert_eq!(out, tensor![[1.0]]);
}

#[test]
fn test_missing_slots() {
    let kernels = Dispatcher::cpu().conv2d(Engine::Internal, params()).unwrap();
    let x = Tensor::filled(1, 16, 1.0);
    let w = Tensor::filled(1, 9, 1.0);
    let b = Tensor::zeros(1, 1);

    let mut ctx = OpKernelContext::forward(vec![&x, &w, &b], vec![]).with_engine(Engine::Internal);
    assert!(matches!(
        kernels.forward.compute(&mut ctx),
        Err(KernelError::MissingSlot { kind: "output", index: 0 })
    ));

    let delta = Tensor::filled(1, 4, 1.0);
    let mut pd = Tensor::default();
    let mut ctx = OpKernelContext::backward(vec![&x, &w, &b], vec![&delta], vec![&mut pd]).with_engine(Engine::Internal);
    assert!(matches!(
        kernels.backward.compute(&mut ctx),
        Err(KernelError::MissingSlot { kind: "input_grad", index: 1 })
    ));
    assert_eq!(pd, Tensor::default());
}

#[test]
fn test_padding_round_trip() {
    let same = Arc::new(
        ConvParams::builder(4, 3, 2)
            .kernel(5, 3)
            .padding(Padding::Same)
            .build()
            .unwrap(),
    );
    let padding = Conv2dPadding::new(Arc::clone(&same));
    let x = Tensor::from_samples(vec![(0..24).map(|v| v as convkit::Float).collect(); 2]);

    let mut padded = Tensor::default();
    padding.pad_input(&x, &mut padded, true).unwrap();
    padded.check_samples(8 * 5 * 2, Some(2), "padded").unwrap();
    // the border is zero; offset is (2, 1)
    assert_eq!(padded.sample(0)[..8], [0.0; 8]);
    assert_eq!(padded.sample(0)[8..14], [0.0, 0.0, 0.0, 1.0, 2.0, 3.0]);

    let mut back = Tensor::default();
    padding.unpad_delta(&padded, &mut back, false).unwrap();
    assert_eq!(back, x);

    let valid = Conv2dPadding::new(params());
    let x = Tensor::filled(3, 16, 2.0);
    let mut scratch = Tensor::default();
    valid.pad_input(&x, &mut scratch, false).unwrap();
    assert_eq!(scratch, x);
    let mut back = Tensor::default();
    valid.unpad_delta(&scratch, &mut back, false).unwrap();
    assert_eq!(back, x);

    assert!(valid.unpad_delta(&Tensor::filled(1, 15, 0.0), &mut back, false).is_err());
    assert_eq!(back, x);
}
