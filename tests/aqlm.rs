//! Integration tests for AQLM decode and multiply.
//!
//! The fused CPU kernel and the partitioned dequantize-then-matmul path are
//! checked against a dense weight rebuilt with plain loops from the random
//! codes, codebooks and scales.

use std::sync::Arc;

use aqlm::quant::aqlm::storage::pack_code;
use aqlm::{
    AqlmConfig, AqlmGemmOps, AqlmLinearMethod, AqlmOps, AqlmPath, AqlmWeights, CodeStorage,
    DType, Error, Tensor, select_path,
};
use numr::ops::ShapeOps;
use numr::runtime::cpu::{CpuClient, CpuDevice, CpuRuntime};

fn setup() -> (CpuClient, CpuDevice) {
    let device = CpuDevice::new();
    let client = CpuClient::new(device.clone());
    (client, device)
}

/// Deterministic pseudo-random sequence in [-0.5, 0.5)
fn lcg_f32(n: usize, seed: u64) -> Vec<f32> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (0..n)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            ((state >> 40) as f32 / (1u64 << 24) as f32) - 0.5
        })
        .collect()
}

fn lcg_codes(n: usize, codebook_size: u64, seed: u64) -> Vec<u64> {
    lcg_f32(n, seed)
        .into_iter()
        .map(|v| (((v + 0.5) * codebook_size as f32) as u64).min(codebook_size - 1))
        .collect()
}

/// Pack unsigned codes into the storage width for `nbits`.
fn codes_tensor(
    values: &[u64],
    shape: &[usize],
    nbits: u32,
    device: &CpuDevice,
) -> Tensor<CpuRuntime> {
    let storage = CodeStorage::for_bits(nbits).unwrap();
    let packed: Vec<i64> = values.iter().map(|&v| pack_code(v, storage)).collect();
    match storage {
        CodeStorage::I8 => {
            let d: Vec<i8> = packed.iter().map(|&v| v as i8).collect();
            Tensor::<CpuRuntime>::from_slice(&d, shape, device)
        }
        CodeStorage::I16 => {
            let d: Vec<i16> = packed.iter().map(|&v| v as i16).collect();
            Tensor::<CpuRuntime>::from_slice(&d, shape, device)
        }
        CodeStorage::I32 => {
            let d: Vec<i32> = packed.iter().map(|&v| v as i32).collect();
            Tensor::<CpuRuntime>::from_slice(&d, shape, device)
        }
        CodeStorage::I64 => Tensor::<CpuRuntime>::from_slice(&packed, shape, device),
    }
}

struct Layer {
    config: AqlmConfig,
    weights: AqlmWeights<CpuRuntime>,
    in_features: usize,
    out_features: usize,
    partitions: Vec<usize>,
    codes: Vec<u64>,
    codebooks: Vec<f32>,
    scales: Vec<f32>,
}

/// Random layer with `partitions` output partitions, each with its own codebooks.
fn random_layer(
    partitions: &[usize],
    in_features: usize,
    num_codebooks: usize,
    nbits: u32,
    in_group_size: usize,
    device: &CpuDevice,
) -> Layer {
    let config = AqlmConfig::new(in_group_size, nbits, num_codebooks, 1).unwrap();
    let out_features: usize = partitions.iter().sum();
    let num_in_groups = in_features / in_group_size;
    let k = config.codebook_size().unwrap();

    let codes = lcg_codes(out_features * num_in_groups * num_codebooks, k as u64, 7);
    let code_shape = [out_features, num_in_groups, num_codebooks];
    let codes_t = codes_tensor(&codes, &code_shape, nbits, device);
    let cb_rows = num_codebooks * partitions.len();
    let codebooks = lcg_f32(cb_rows * k * in_group_size, 11);
    let codebooks_t =
        Tensor::<CpuRuntime>::from_slice(&codebooks, &[cb_rows, k, 1, in_group_size], device);
    let scales: Vec<f32> = lcg_f32(out_features, 13).iter().map(|v| 1.0 + v).collect();
    let scales_t = Tensor::<CpuRuntime>::from_slice(&scales, &[out_features, 1, 1, 1], device);

    let weights = AqlmWeights::from_parts(
        &config,
        codes_t,
        codebooks_t,
        scales_t,
        Some(partitions.to_vec()),
    );
    Layer {
        config,
        weights,
        in_features,
        out_features,
        partitions: partitions.to_vec(),
        codes,
        codebooks,
        scales,
    }
}

fn assert_close(a: &[f32], b: &[f32], rtol: f32, atol: f32, what: &str) {
    assert_eq!(a.len(), b.len(), "{what}: length mismatch");
    for (i, (&x, &y)) in a.iter().zip(b.iter()).enumerate() {
        let tol = atol + rtol * y.abs();
        assert!(
            (x - y).abs() <= tol,
            "{what}: mismatch at {i}: {x} vs {y} (tol {tol})"
        );
    }
}

/// Dense weight `[out, in]` built with plain loops: for each output row and
/// input group, sum the selected atom of every codebook in the row's
/// partition block, then apply the row scale.
fn reference_weight(layer: &Layer) -> Vec<f32> {
    let (n, k_in) = (layer.out_features, layer.in_features);
    let ncb = layer.config.num_codebooks;
    let ig = layer.config.in_group_size;
    let k = layer.config.codebook_size().unwrap();
    let num_in_groups = k_in / ig;

    let mut partition_of = Vec::with_capacity(n);
    for (p, &size) in layer.partitions.iter().enumerate() {
        partition_of.extend(std::iter::repeat_n(p, size));
    }

    let mut weight = vec![0.0f32; n * k_in];
    for f in 0..n {
        for j in 0..num_in_groups {
            for c in 0..ncb {
                let code = layer.codes[(f * num_in_groups + j) * ncb + c] as usize;
                let codebook = partition_of[f] * ncb + c;
                let atom = &layer.codebooks[(codebook * k + code) * ig..][..ig];
                for (e, &a) in atom.iter().enumerate() {
                    weight[f * k_in + j * ig + e] += a;
                }
            }
        }
        for v in &mut weight[f * k_in..(f + 1) * k_in] {
            *v *= layer.scales[f];
        }
    }
    weight
}

/// `x @ W^T` for row-major `x [rows, in]` against [`reference_weight`].
fn reference_output(layer: &Layer, x: &[f32]) -> Vec<f32> {
    let weight = reference_weight(layer);
    let (n, k_in) = (layer.out_features, layer.in_features);
    let rows = x.len() / k_in;
    let mut out = vec![0.0f32; rows * n];
    for i in 0..rows {
        for f in 0..n {
            out[i * n + f] = (0..k_in)
                .map(|e| x[i * k_in + e] * weight[f * k_in + e])
                .sum();
        }
    }
    out
}

#[test]
fn test_concrete_scenario() {
    let (client, device) = setup();
    #[rustfmt::skip]
    let codebooks = Tensor::<CpuRuntime>::from_slice(
        &[
            1.0f32, 0.0,  0.0, 1.0,  1.0, 1.0,  0.0, 0.0,
            2.0, 0.0,     0.0, 2.0,  1.0, 1.0,  3.0, 0.0,
        ],
        &[2, 4, 1, 2],
        &device,
    );
    let codes = Tensor::<CpuRuntime>::from_slice(&[0i8, 1], &[1, 1, 2], &device);
    let scales = Tensor::<CpuRuntime>::from_slice(&[1.0f32], &[1, 1, 1, 1], &device);

    let unpacked = client.aqlm_unpack_codes(&codes, 2).unwrap();
    let w = client
        .aqlm_dequantize(&unpacked, &codebooks, Some(&scales))
        .unwrap();
    assert_eq!(w.shape(), &[1, 2]);
    assert_eq!(w.to_vec::<f32>(), vec![1.0, 2.0]);

    // x = e0, e1 picks out the decoded columns
    let x = Tensor::<CpuRuntime>::from_slice(&[1.0f32, 0.0, 0.0, 1.0], &[2, 2], &device);
    let fused = client
        .aqlm_gemm(&x, &codes, &codebooks, &scales, None, None)
        .unwrap();
    assert_eq!(fused.to_vec::<f32>(), vec![1.0, 2.0]);
}

#[test]
fn test_path_equivalence_around_threshold() {
    let (client, device) = setup();
    let partitions = [8usize, 4, 4];
    let layer = random_layer(&partitions, 32, 2, 8, 8, &device);
    let kernel: Arc<dyn AqlmGemmOps<CpuRuntime>> = Arc::new(CpuClient::new(device.clone()));
    let method = AqlmLinearMethod::new(layer.config, Some(kernel)).unwrap();
    let w = &layer.weights;

    for rows in [31usize, 32, 33] {
        let x = Tensor::<CpuRuntime>::from_slice(
            &lcg_f32(rows * layer.in_features, rows as u64),
            &[rows, layer.in_features],
            &device,
        );
        let fused = client
            .aqlm_gemm(&x, &w.codes, &w.codebooks, &w.scales, Some(&partitions[..]), None)
            .unwrap();
        let dequant = client
            .aqlm_partitioned_gemm(&x, &w.codes, &w.codebooks, &w.scales, &partitions, None)
            .unwrap();
        assert_eq!(fused.shape(), &[rows, layer.out_features]);
        assert_eq!(dequant.shape(), &[rows, layer.out_features]);
        let expected = reference_output(&layer, &x.to_vec::<f32>());
        assert_close(
            &fused.to_vec::<f32>(),
            &expected,
            1e-4,
            1e-5,
            &format!("fused vs reference, rows={rows}"),
        );
        assert_close(
            &dequant.to_vec::<f32>(),
            &expected,
            1e-4,
            1e-5,
            &format!("dequant vs reference, rows={rows}"),
        );

        let expected_path = if rows <= 32 {
            AqlmPath::FusedGemv
        } else {
            AqlmPath::DequantGemm
        };
        assert_eq!(select_path(x.shape(), w.output_partition_sizes()), expected_path);

        let applied = method.apply_weights(&client, w, &x, None).unwrap();
        assert_close(
            &applied.to_vec::<f32>(),
            &expected,
            1e-4,
            1e-5,
            &format!("apply_weights, rows={rows}"),
        );
    }
}

#[test]
fn test_partitioned_matches_dense_reference() {
    let (client, device) = setup();
    let partitions = [6usize, 2, 2];
    let layer = random_layer(&partitions, 16, 2, 4, 4, &device);
    let w = &layer.weights;

    let x = Tensor::<CpuRuntime>::from_slice(&lcg_f32(3 * 2 * 16, 5), &[3, 2, 16], &device);
    let bias = Tensor::<CpuRuntime>::from_slice(&lcg_f32(10, 17), &[10], &device);

    let out = client
        .aqlm_partitioned_gemm(&x, &w.codes, &w.codebooks, &w.scales, &partitions, Some(&bias))
        .unwrap();
    assert_eq!(out.shape(), &[3, 2, 10]);

    let mut expected = reference_output(&layer, &x.to_vec::<f32>());
    let b = bias.to_vec::<f32>();
    for (i, v) in expected.iter_mut().enumerate() {
        *v += b[i % 10];
    }
    assert_close(&out.to_vec::<f32>(), &expected, 1e-4, 1e-5, "partitioned vs reference");

    let fused = client
        .aqlm_gemm(&x, &w.codes, &w.codebooks, &w.scales, Some(&partitions[..]), Some(&bias))
        .unwrap();
    assert_close(&fused.to_vec::<f32>(), &expected, 1e-4, 1e-5, "fused vs reference");
}

#[test]
fn test_partition_additivity_with_shared_codebooks() {
    let (client, device) = setup();
    let single = random_layer(&[12], 16, 1, 6, 8, &device);
    let w = &single.weights;

    // two partitions whose codebook blocks are both copies of the single block
    let codebooks = client.cat(&[&w.codebooks, &w.codebooks], 0).unwrap();
    let x = Tensor::<CpuRuntime>::from_slice(&lcg_f32(40 * 16, 3), &[40, 16], &device);

    let whole = client
        .aqlm_dequantize_gemm(&x, &w.codes, &w.codebooks, &w.scales, None)
        .unwrap();
    let split = client
        .aqlm_partitioned_gemm(&x, &w.codes, &codebooks, &w.scales, &[5, 7], None)
        .unwrap();
    assert_close(
        &split.to_vec::<f32>(),
        &whole.to_vec::<f32>(),
        1e-5,
        1e-6,
        "partition additivity",
    );
}

#[test]
fn test_sixteen_bit_codes_above_signed_range() {
    let (client, device) = setup();
    let nbits = 16;
    let k = 1usize << nbits;
    let mut cb = vec![0.0f32; k];
    cb[40000] = 2.0;
    cb[65535] = -3.0;
    cb[7] = 0.5;
    let codebooks = Tensor::<CpuRuntime>::from_slice(&cb, &[1, k, 1, 1], &device);
    let codes = codes_tensor(&[40000, 65535, 7], &[1, 3, 1], nbits, &device);
    assert_eq!(codes.dtype(), DType::I16);
    let scales = Tensor::<CpuRuntime>::from_slice(&[1.0f32], &[1, 1, 1, 1], &device);
    let x = Tensor::<CpuRuntime>::from_slice(&[1.0f32, 1.0, 1.0], &[1, 3], &device);

    let fused = client
        .aqlm_gemm(&x, &codes, &codebooks, &scales, None, None)
        .unwrap();
    let dequant = client
        .aqlm_dequantize_gemm(&x, &codes, &codebooks, &scales, None)
        .unwrap();
    assert_eq!(fused.to_vec::<f32>(), vec![-0.5]);
    assert_eq!(dequant.to_vec::<f32>(), vec![-0.5]);
}

#[test]
fn test_partition_sum_mismatch_is_rejected() {
    let (client, device) = setup();
    let layer = random_layer(&[4, 4], 8, 1, 4, 4, &device);
    let w = &layer.weights;
    let x = Tensor::<CpuRuntime>::ones(&[64, 8], DType::F32, &device);

    let result = client.aqlm_partitioned_gemm(&x, &w.codes, &w.codebooks, &w.scales, &[4, 3], None);
    assert!(matches!(result, Err(Error::InvariantViolation { .. })));

    let too_many = [4usize, 5];
    let result = client.aqlm_gemm(&x, &w.codes, &w.codebooks, &w.scales, Some(&too_many[..]), None);
    assert!(matches!(result, Err(Error::InvariantViolation { .. })));

    // the dequantize path is taken for 64 rows, so apply_weights surfaces the same error
    let bad = AqlmWeights::from_parts(
        &layer.config,
        w.codes.clone(),
        w.codebooks.clone(),
        w.scales.clone(),
        Some(vec![2, 2]),
    );
    let kernel: Arc<dyn AqlmGemmOps<CpuRuntime>> = Arc::new(CpuClient::new(device.clone()));
    let method = AqlmLinearMethod::new(layer.config, Some(kernel)).unwrap();
    let result = method.apply_weights(&client, &bad, &x, None);
    assert!(matches!(result, Err(Error::InvariantViolation { .. })));
}

#[test]
fn test_unpartitioned_weights_use_fused_kernel() {
    let (client, device) = setup();
    let layer = random_layer(&[6], 16, 2, 4, 8, &device);
    let w = &layer.weights;
    let plain = AqlmWeights::from_parts(
        &layer.config,
        w.codes.clone(),
        w.codebooks.clone(),
        w.scales.clone(),
        None,
    );
    let x = Tensor::<CpuRuntime>::from_slice(&lcg_f32(100 * 16, 9), &[100, 16], &device);
    assert_eq!(select_path(x.shape(), None), AqlmPath::FusedGemv);

    let kernel: Arc<dyn AqlmGemmOps<CpuRuntime>> = Arc::new(CpuClient::new(device.clone()));
    let method = AqlmLinearMethod::new(layer.config, Some(kernel)).unwrap();
    let out = method.apply_weights(&client, &plain, &x, None).unwrap();
    let expected = reference_output(&layer, &x.to_vec::<f32>());
    assert_close(&out.to_vec::<f32>(), &expected, 1e-4, 1e-5, "unpartitioned fused");
}

#[test]
fn test_config_from_json_drives_create_weights() {
    let (_client, device) = setup();
    let config = AqlmConfig::from_json(
        r#"{"quant_method": "aqlm", "in_group_size": 8, "nbits_per_codebook": 16,
            "num_codebooks": 1, "out_group_size": 1}"#,
    )
    .unwrap();
    let kernel: Arc<dyn AqlmGemmOps<CpuRuntime>> = Arc::new(CpuClient::new(device.clone()));
    let method = AqlmLinearMethod::new(config, Some(kernel)).unwrap();
    let w = method.create_weights(32, &[8, 8], DType::F32, &device).unwrap();
    assert_eq!(w.codes.shape(), &[16, 4, 1]);
    assert_eq!(w.codes.dtype(), DType::I16);
    assert_eq!(w.codebooks.shape(), &[2, 65536, 1, 8]);
    assert_eq!(w.scales.shape(), &[16, 1, 1, 1]);
}

#[test]
fn test_missing_kernel_is_a_config_error() {
    let config = AqlmConfig::new(8, 8, 1, 1).unwrap();
    let err = AqlmLinearMethod::<CpuRuntime>::new(config, None)
        .err()
        .unwrap();
    assert!(matches!(err, Error::MissingKernel { .. }));
}

#[test]
fn test_moe_fails_loudly() {
    let (_client, device) = setup();
    let layer = random_layer(&[4], 8, 1, 4, 4, &device);
    let kernel: Arc<dyn AqlmGemmOps<CpuRuntime>> = Arc::new(CpuClient::new(device.clone()));
    let method = AqlmLinearMethod::new(layer.config, Some(kernel)).unwrap();
    let x = Tensor::<CpuRuntime>::ones(&[2, 8], DType::F32, &device);
    let gating = Tensor::<CpuRuntime>::ones(&[2, 4], DType::F32, &device);
    let result = method.apply_moe_weights(&layer.weights, &layer.weights, &x, &gating, 2, true);
    assert!(matches!(result, Err(Error::Unsupported { .. })));
    assert!(!layer.config.support_fused_moe());
}
