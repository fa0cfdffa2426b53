mod common;

use common::{random_tensor, rng};
use convkit::approx::{ENGINE_TOLERANCE, max_rel_diff, tensors_rel_eq};
use convkit::backend::Engine;
use convkit::layer::{Conv2dLayer, Gradients};
use convkit::ops::dispatch::Dispatcher;
use convkit::params::{ConnectionTable, ConvParams, Padding};
use convkit::tensors::Tensor;

struct Case {
    params: ConvParams,
    batch: usize,
}

fn cases() -> Vec<Case> {
    let p = |w, h, c, k, o, pad, s| {
        ConvParams::builder(w, h, c)
            .kernel(k, k)
            .out_channels(o)
            .padding(pad)
            .stride(s, s)
            .build()
            .unwrap()
    };
    vec![
        // 5x5 on 6x6 gives a 2x2 output
        Case { params: p(6, 6, 1, 5, 1, Padding::Valid, 1), batch: 3 },
        // a 5x5 frame collapses to one output value
        Case { params: p(5, 5, 2, 5, 3, Padding::Valid, 1), batch: 2 },
        Case { params: p(9, 7, 3, 5, 2, Padding::Same, 1), batch: 2 },
        Case { params: p(11, 9, 2, 5, 2, Padding::Valid, 2), batch: 2 },
        Case { params: p(8, 6, 3, 3, 4, Padding::Same, 1), batch: 4 },
        Case { params: p(7, 7, 2, 3, 2, Padding::Valid, 2), batch: 1 },
        // in 0 feeds outputs 0 and 2, in 1 feeds outputs 1 and 2
        Case {
            params: ConvParams::builder(7, 6, 2)
                .kernel(5, 5)
                .out_channels(3)
                .table(ConnectionTable::from_matrix(&[true, false, true, false, true, true], 2, 3).unwrap())
                .build()
                .unwrap(),
            batch: 2,
        },
        Case {
            params: ConvParams::builder(8, 8, 4)
                .kernel(5, 5)
                .out_channels(2)
                .groups(2)
                .padding(Padding::Same)
                .build()
                .unwrap(),
            batch: 2,
        },
        Case {
            params: ConvParams::builder(9, 9, 4)
                .kernel(3, 3)
                .out_channels(4)
                .groups(2)
                .stride(2, 2)
                .build()
                .unwrap(),
            batch: 3,
        },
        // sparse table on a 5x5 frame with a single output value
        Case {
            params: ConvParams::builder(5, 5, 2)
                .kernel(5, 5)
                .out_channels(2)
                .table(ConnectionTable::from_matrix(&[true, false, true, true], 2, 2).unwrap())
                .build()
                .unwrap(),
            batch: 2,
        },
    ]
}

struct Data {
    x: Tensor,
    w: Tensor,
    b: Tensor,
    delta: Tensor,
}

fn data(params: &ConvParams, batch: usize, seed: u64) -> Data {
    let mut rng = rng(seed);
    Data {
        x: random_tensor(&mut rng, batch, params.input().size()),
        w: random_tensor(&mut rng, 1, params.weight().size()),
        b: random_tensor(&mut rng, 1, params.output().depth),
        delta: random_tensor(&mut rng, batch, params.output().size()),
    }
}

fn run(layer: &mut Conv2dLayer, d: &Data, with_backward: bool) -> (Tensor, Option<Gradients>) {
    let out = layer.forward(&d.x, &d.w, &d.b).unwrap();
    let grads = with_backward.then(|| layer.backward(&d.x, &d.w, &d.b, &d.delta).unwrap());
    (out, grads)
}

fn assert_grads_close(a: &Gradients, b: &Gradients, engine: Engine) {
    assert!(
        tensors_rel_eq(&a.prev_delta, &b.prev_delta, ENGINE_TOLERANCE),
        "prev_delta differs on {engine}"
    );
    assert!(tensors_rel_eq(&a.dw, &b.dw, ENGINE_TOLERANCE), "dW differs on {engine}");
    assert!(tensors_rel_eq(&a.db, &b.db, ENGINE_TOLERANCE), "db differs on {engine}");
}

#[test]
fn test_cpu_engines_agree_with_internal() {
    for (seed, case) in cases().into_iter().enumerate() {
        let d = data(&case.params, case.batch, seed as u64);
        let mut layer = Conv2dLayer::with_dispatcher(case.params, Dispatcher::cpu(), Engine::Internal).unwrap();
        let (reference, reference_grads) = run(&mut layer, &d, true);
        let reference_grads = reference_grads.unwrap();

        layer.set_engine(Engine::Avx).unwrap();
        let (out, grads) = run(&mut layer, &d, true);
        assert!(
            tensors_rel_eq(&reference, &out, ENGINE_TOLERANCE),
            "avx forward differs by {}",
            max_rel_diff(reference.sample(0), out.sample(0))
        );
        assert_grads_close(&reference_grads, &grads.unwrap(), Engine::Avx);

        layer.set_engine(Engine::Nnpack).unwrap();
        let (out, _) = run(&mut layer, &d, false);
        assert!(
            tensors_rel_eq(&reference, &out, ENGINE_TOLERANCE),
            "nnpack forward differs by {}",
            max_rel_diff(reference.sample(0), out.sample(0))
        );
    }
}

#[test]
fn test_cases_cover_sparse_tables() {
    let sparse = cases().iter().filter(|c| !c.params.table().is_dense()).count();
    assert_eq!(sparse, 4);
}

#[test]
fn test_avx_matches_internal_exactly_on_integer_data() {
    let params = ConvParams::builder(6, 6, 2).kernel(5, 5).out_channels(2).build().unwrap();
    let x = Tensor::from_samples(vec![(0..72).map(|v| (v % 7) as convkit::Float - 3.0).collect()]);
    let w = Tensor::from_samples(vec![(0..100).map(|v| (v % 5) as convkit::Float - 2.0).collect()]);
    let b = Tensor::from_samples(vec![vec![1.0, -1.0]]);

    let mut layer = Conv2dLayer::with_dispatcher(params, Dispatcher::cpu(), Engine::Internal).unwrap();
    let reference = layer.forward(&x, &w, &b).unwrap();
    layer.set_engine(Engine::Avx).unwrap();
    assert_eq!(layer.forward(&x, &w, &b).unwrap(), reference);
}

#[cfg(feature = "wgpu")]
#[test]
fn test_libdnn_agrees_with_internal() {
    let Ok(dispatcher) = Dispatcher::gpu() else {
        eprintln!("no GPU adapter available, skipping");
        return;
    };
    for (seed, case) in cases().into_iter().enumerate() {
        let d = data(&case.params, case.batch, 100 + seed as u64);
        let mut cpu = Conv2dLayer::with_dispatcher(case.params.clone(), Dispatcher::cpu(), Engine::Internal).unwrap();
        let mut gpu = Conv2dLayer::with_dispatcher(case.params, dispatcher.clone(), Engine::Libdnn).unwrap();

        let (reference, reference_grads) = run(&mut cpu, &d, true);
        let (out, grads) = run(&mut gpu, &d, true);
        assert!(tensors_rel_eq(&reference, &out, ENGINE_TOLERANCE), "libdnn forward differs");
        assert_grads_close(&reference_grads.unwrap(), &grads.unwrap(), Engine::Libdnn);
    }
}

#[cfg(feature = "wgpu")]
#[test]
fn test_libdnn_validates_slots_before_device_work() {
    use convkit::error::KernelError;
    use convkit::{OpKernel, OpKernelContext, tensor};
    use std::sync::Arc;

    let Ok(dispatcher) = Dispatcher::gpu() else {
        eprintln!("no GPU adapter available, skipping");
        return;
    };
    let params = Arc::new(ConvParams::builder(4, 4, 1).kernel(3, 3).build().unwrap());
    let kernels = dispatcher.conv2d(Engine::Libdnn, params).unwrap();
    let x = Tensor::filled(2, 16, 1.0);
    let w = Tensor::filled(1, 9, 1.0);
    let b = tensor![[0.5]];

    let mut ctx = OpKernelContext::forward(vec![&x, &w, &b], vec![]);
    assert!(matches!(
        kernels.forward.compute(&mut ctx),
        Err(KernelError::MissingSlot { kind: "output", index: 0 })
    ));

    // dW holds one sample for a batch of two
    let delta = Tensor::filled(2, 4, 1.0);
    let mut pd = Tensor::filled(2, 16, 7.0);
    let mut dw = Tensor::zeros(1, 9);
    let mut db = Tensor::default();
    {
        let mut ctx = OpKernelContext::backward(vec![&x, &w, &b], vec![&delta], vec![&mut pd, &mut dw, &mut db]);
        assert!(matches!(
            kernels.backward.compute(&mut ctx),
            Err(KernelError::ShapeMismatch { what: "dW", .. })
        ));
    }
    assert_eq!(pd, Tensor::filled(2, 16, 7.0));
    assert_eq!(dw, Tensor::zeros(1, 9));
    assert!(db.samples().is_empty());

    let mut out = Tensor::filled(3, 1, 9.0);
    let mut ctx = OpKernelContext::forward(vec![&x, &w, &b], vec![&mut out]);
    kernels.forward.compute(&mut ctx).unwrap();
    assert!(tensors_rel_eq(&out, &Tensor::filled(2, 4, 9.5), ENGINE_TOLERANCE));
}
