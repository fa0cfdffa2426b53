mod common;

use common::{random_tensor, rng};
use convkit::backend::Engine;
use convkit::layer::Conv2dLayer;
use convkit::ops::dispatch::Dispatcher;
use convkit::params::{ConnectionTable, ConvParams, Padding, conv_out_length};
use convkit::tensors::Tensor;
use convkit::{OpKernelContext, tensor};
use std::sync::Arc;

fn layer(params: ConvParams) -> Conv2dLayer {
    Conv2dLayer::with_dispatcher(params, Dispatcher::cpu(), Engine::Internal).unwrap()
}

#[test]
fn test_output_length_formula() {
    assert_eq!(conv_out_length(28, 5, 1, Padding::Valid).unwrap(), 24);
    assert_eq!(conv_out_length(28, 5, 1, Padding::Same).unwrap(), 28);
    assert_eq!(conv_out_length(7, 3, 2, Padding::Valid).unwrap(), 3);
    assert_eq!(conv_out_length(7, 3, 2, Padding::Same).unwrap(), 4);
    assert!(conv_out_length(4, 5, 1, Padding::Valid).is_err());
    assert!(conv_out_length(4, 3, 0, Padding::Valid).is_err());
}

#[test]
fn test_all_ones_5x5_on_6x6() {
    let params = ConvParams::builder(6, 6, 1).kernel(5, 5).build().unwrap();
    assert_eq!(params.output().size(), 4);
    let mut layer = layer(params);

    let out = layer
        .forward(&Tensor::filled(1, 36, 1.0), &Tensor::filled(1, 25, 1.0), &Tensor::zeros(1, 1))
        .unwrap();
    assert_eq!(out, tensor![[25.0, 25.0, 25.0, 25.0]]);
}

#[test]
fn test_bias_is_added_per_output_channel() {
    let params = ConvParams::builder(3, 3, 1).kernel(3, 3).out_channels(2).build().unwrap();
    let mut layer = layer(params);
    let out = layer
        .forward(&Tensor::filled(1, 9, 1.0), &Tensor::filled(1, 18, 1.0), &tensor![[0.5, -2.0]])
        .unwrap();
    assert_eq!(out, tensor![[9.5, 7.0]]);
}

#[test]
fn test_bias_free_layer_ignores_bias_slot() {
    let params = ConvParams::builder(3, 3, 1).kernel(3, 3).bias(false).build().unwrap();
    let mut layer = layer(params);
    let out = layer
        .forward(&Tensor::filled(1, 9, 2.0), &Tensor::filled(1, 9, 1.0), &Tensor::default())
        .unwrap();
    assert_eq!(out, tensor![[18.0]]);
}

#[test]
fn test_same_padding_keeps_spatial_size() {
    let params = ConvParams::builder(3, 3, 1)
        .kernel(3, 3)
        .padding(Padding::Same)
        .build()
        .unwrap();
    let mut layer = layer(params);
    let out = layer
        .forward(&Tensor::filled(1, 9, 1.0), &Tensor::filled(1, 9, 1.0), &Tensor::zeros(1, 1))
        .unwrap();
    // corners see 4 taps, edges 6, the centre 9
    assert_eq!(out, tensor![[4.0, 6.0, 4.0, 6.0, 9.0, 6.0, 4.0, 6.0, 4.0]]);
}

#[test]
fn test_forward_is_independent_per_sample() {
    let mut rng = rng(7);
    let params = ConvParams::builder(6, 5, 2).kernel(3, 3).out_channels(3).build().unwrap();
    let mut layer = layer(params);
    let a = random_tensor(&mut rng, 1, 60);
    let b = random_tensor(&mut rng, 1, 60);
    let w = random_tensor(&mut rng, 1, 54);
    let bias = random_tensor(&mut rng, 1, 3);

    let both = layer
        .forward(
            &Tensor::from_samples(vec![a.sample(0).to_vec(), b.sample(0).to_vec()]),
            &w,
            &bias,
        )
        .unwrap();
    let only_a = layer.forward(&a, &w, &bias).unwrap();
    let only_b = layer.forward(&b, &w, &bias).unwrap();
    assert_eq!(both.sample(0), only_a.sample(0));
    assert_eq!(both.sample(1), only_b.sample(0));
}

#[test]
fn test_sequential_and_parallel_batches_agree() {
    let mut rng = rng(11);
    let params = ConvParams::builder(5, 5, 2).kernel(3, 3).out_channels(2).build().unwrap();
    let mut layer = layer(params);
    let x = random_tensor(&mut rng, 8, 50);
    let w = random_tensor(&mut rng, 1, 36);
    let bias = random_tensor(&mut rng, 1, 2);

    let parallel = layer.forward(&x, &w, &bias).unwrap();
    layer.set_parallelize(false);
    let sequential = layer.forward(&x, &w, &bias).unwrap();
    assert_eq!(parallel, sequential);
}

#[test]
fn test_empty_batch_yields_empty_output() {
    let params = ConvParams::builder(4, 4, 1).kernel(3, 3).build().unwrap();
    let mut layer = layer(params);
    let out = layer
        .forward(&Tensor::default(), &Tensor::filled(1, 9, 1.0), &Tensor::zeros(1, 1))
        .unwrap();
    assert_eq!(out.sample_count(), 0);
}

#[test]
fn test_disconnected_channels_are_skipped() {
    let mut rng = rng(3);
    // input 0 feeds output 0 only, input 1 feeds output 1 only
    let table = ConnectionTable::from_matrix(&[true, false, false, true], 2, 2).unwrap();
    let sparse = ConvParams::builder(4, 4, 2)
        .kernel(3, 3)
        .out_channels(2)
        .table(table)
        .build()
        .unwrap();
    let dense = ConvParams::builder(4, 4, 2).kernel(3, 3).out_channels(2).build().unwrap();

    let x = random_tensor(&mut rng, 2, 32);
    let w = random_tensor(&mut rng, 1, 36);
    let bias = random_tensor(&mut rng, 1, 2);

    // weight channel index is in_depth * out + in
    let mut w_zeroed = w.clone();
    for (o, i) in [(0, 1), (1, 0)] {
        let channel = 2 * o + i;
        w_zeroed.sample_mut(0)[channel * 9..(channel + 1) * 9].fill(0.0);
    }

    let mut sparse_layer = layer(sparse);
    let mut dense_layer = layer(dense);
    let a = sparse_layer.forward(&x, &w, &bias).unwrap();
    let b = dense_layer.forward(&x, &w_zeroed, &bias).unwrap();
    assert_eq!(a, b);

    let delta = random_tensor(&mut rng, 2, 8);
    let ga = sparse_layer.backward(&x, &w, &bias, &delta).unwrap();
    let gb = dense_layer.backward(&x, &w_zeroed, &bias, &delta).unwrap();
    assert_eq!(ga.prev_delta, gb.prev_delta);
    assert_eq!(ga.db, gb.db);
    for channel in [1, 2] {
        assert!(ga.dw.sample(0)[channel * 9..(channel + 1) * 9].iter().all(|&v| v == 0.0));
    }
    for channel in [0, 3] {
        assert_eq!(
            ga.dw.sample(0)[channel * 9..(channel + 1) * 9],
            gb.dw.sample(0)[channel * 9..(channel + 1) * 9]
        );
    }
}

#[test]
fn test_grouped_table_matches_block_diagonal() {
    let grouped = ConvParams::builder(3, 3, 4).kernel(3, 3).out_channels(2).groups(2).build().unwrap();
    let table = grouped.table();
    assert!(table.is_connected(0, 0) && table.is_connected(0, 1));
    assert!(!table.is_connected(0, 2) && !table.is_connected(1, 1));
    assert!(table.is_connected(1, 2) && table.is_connected(1, 3));
    assert!(
        ConvParams::builder(3, 3, 3)
            .kernel(3, 3)
            .out_channels(2)
            .groups(2)
            .build()
            .is_err()
    );
}

#[test]
fn test_kernel_driven_directly_through_context() {
    let params = Arc::new(ConvParams::builder(4, 4, 1).kernel(3, 3).stride(1, 1).build().unwrap());
    let kernels = Dispatcher::cpu().conv2d(Engine::Nnpack, Arc::clone(&params)).unwrap();
    assert_eq!(kernels.params.output().size(), 4);

    let input = Tensor::from_samples(vec![(0..16).map(|v| v as convkit::Float).collect()]);
    let weight = Tensor::filled(1, 9, 1.0);
    let bias = Tensor::zeros(1, 1);
    let mut out = Tensor::default();
    let mut ctx = OpKernelContext::forward(vec![&input, &weight, &bias], vec![&mut out])
        .with_engine(Engine::Nnpack);
    kernels.forward.compute(&mut ctx).unwrap();
    assert_eq!(out, tensor![[45.0, 54.0, 81.0, 90.0]]);
}
