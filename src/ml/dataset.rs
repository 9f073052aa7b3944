//! 学習・評価用データセットとバッチャー
//!
//! データセットの取得（ダウンロード）は扱いません。ローカルに置かれた IDX 形式のファイル
//! （Fashion-MNIST / MNIST と同じ形式）を読み込むか、テスト用の合成データを生成します。

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    tensor::{backend::Backend, Int, Tensor},
};
use flate2::read::GzDecoder;
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

use crate::error::ContractError;
use crate::ml::ml_model::NUM_CLASSES;
use crate::ml::preprocess::{
    NormalizationContract, RawImage, CHANNELS, IMAGE_HEIGHT, IMAGE_WIDTH, PIXELS,
};

const IMAGES_MAGIC: u32 = 0x0000_0803;
const LABELS_MAGIC: u32 = 0x0000_0801;

/// データセットの分割
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    fn file_prefix(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Test => "t10k",
        }
    }
}

/// 画像とラベルの組
#[derive(Clone, Debug)]
pub struct Sample {
    pub image: RawImage,
    pub label: usize,
}

impl Sample {
    pub fn new(image: RawImage, label: usize) -> Result<Self, ContractError> {
        if label >= NUM_CLASSES {
            return Err(ContractError::Label {
                label,
                num_classes: NUM_CLASSES,
            });
        }
        Ok(Self { image, label })
    }
}

/// メモリ上のサンプル列（クローンは安価）
#[derive(Clone, Debug)]
pub struct SampleDataset {
    samples: Arc<Vec<Sample>>,
}

impl SampleDataset {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self {
            samples: Arc::new(samples),
        }
    }

    /// IDX形式のファイルを読み込む
    ///
    /// `train-images-idx3-ubyte` / `train-labels-idx1-ubyte`（テストは `t10k-` で始まる）を探し、
    /// 見つからない場合は `.gz` 付きのファイルを試します。
    pub fn from_idx_dir(dir: &Path, split: Split) -> Result<Self> {
        let prefix = split.file_prefix();
        let images = read_idx_file(&dir.join(format!("{prefix}-images-idx3-ubyte")))?;
        let labels = read_idx_file(&dir.join(format!("{prefix}-labels-idx1-ubyte")))?;

        let images = parse_images(&images)?;
        let labels = parse_labels(&labels)?;

        if images.len() != labels.len() {
            anyhow::bail!(
                "画像数とラベル数が一致しません: images={}, labels={}",
                images.len(),
                labels.len()
            );
        }

        let samples = images
            .into_iter()
            .zip(labels)
            .map(|(image, label)| Sample::new(image, label as usize))
            .collect::<Result<Vec<_>, _>>()?;

        log::info!(
            "{} から {:?} データを {} 件読み込みました",
            dir.display(),
            split,
            samples.len()
        );

        Ok(Self::new(samples))
    }

    /// クラスごとに形の違う合成画像を生成する（各クラス同数）
    ///
    /// クラス k は 4 + 2k 行目から始まる太さ2行の横線を持ち、背景には弱いノイズが乗ります。
    pub fn synthetic(per_class: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut samples = Vec::with_capacity(per_class * NUM_CLASSES);

        for label in 0..NUM_CLASSES {
            for _ in 0..per_class {
                let mut pixels = vec![0u8; PIXELS];
                for pixel in pixels.iter_mut() {
                    *pixel = rng.gen_range(0..40);
                }
                let top = 4 + label * 2;
                for y in top..top + 2 {
                    for x in 4..IMAGE_WIDTH - 4 {
                        pixels[y * IMAGE_WIDTH + x] = rng.gen_range(200..=255);
                    }
                }

                if let Ok(image) = RawImage::from_vec(pixels) {
                    samples.push(Sample { image, label });
                }
            }
        }

        samples.shuffle(&mut rng);
        Self::new(samples)
    }
}

impl Dataset<Sample> for SampleDataset {
    fn get(&self, index: usize) -> Option<Sample> {
        self.samples.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// ファイルを読み込む（存在しなければ `.gz` 版を展開して読む）
fn read_idx_file(path: &Path) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();

    if path.exists() {
        File::open(path)
            .with_context(|| format!("Failed to open {:?}", path))?
            .read_to_end(&mut buffer)?;
        return Ok(buffer);
    }

    let gz_path = PathBuf::from(format!("{}.gz", path.display()));
    let file = File::open(&gz_path)
        .with_context(|| format!("Failed to open {:?} or {:?}", path, gz_path))?;
    GzDecoder::new(file)
        .read_to_end(&mut buffer)
        .with_context(|| format!("Failed to decompress {:?}", gz_path))?;
    Ok(buffer)
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    let chunk = bytes
        .get(offset..offset + 4)
        .ok_or_else(|| anyhow::anyhow!("IDX header is truncated"))?;
    Ok(u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
}

/// 画像ファイル: magic(4) count(4) rows(4) cols(4) の16バイトヘッダの後にピクセル列
fn parse_images(bytes: &[u8]) -> Result<Vec<RawImage>> {
    let magic = read_u32(bytes, 0)?;
    if magic != IMAGES_MAGIC {
        anyhow::bail!("Invalid IDX image magic number: {:#010x}", magic);
    }

    let count = read_u32(bytes, 4)? as usize;
    let rows = read_u32(bytes, 8)? as usize;
    let cols = read_u32(bytes, 12)? as usize;
    if rows != IMAGE_HEIGHT || cols != IMAGE_WIDTH {
        anyhow::bail!(
            "画像サイズが不正です: {}x{} (期待: {}x{})",
            cols,
            rows,
            IMAGE_WIDTH,
            IMAGE_HEIGHT
        );
    }

    let body = &bytes[16..];
    if body.len() != count * PIXELS {
        anyhow::bail!(
            "IDX image body has {} bytes, header implies {}",
            body.len(),
            count * PIXELS
        );
    }

    body.chunks(PIXELS)
        .map(|chunk| RawImage::from_vec(chunk.to_vec()).map_err(anyhow::Error::from))
        .collect()
}

/// ラベルファイル: magic(4) count(4) の8バイトヘッダの後にラベル列
fn parse_labels(bytes: &[u8]) -> Result<Vec<u8>> {
    let magic = read_u32(bytes, 0)?;
    if magic != LABELS_MAGIC {
        anyhow::bail!("Invalid IDX label magic number: {:#010x}", magic);
    }

    let count = read_u32(bytes, 4)? as usize;
    let body = &bytes[8..];
    if body.len() != count {
        anyhow::bail!(
            "IDX label body has {} bytes, header implies {}",
            body.len(),
            count
        );
    }

    Ok(body.to_vec())
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct SampleBatch<B: Backend> {
    /// [batch_size, 1, 28, 28]
    pub images: Tensor<B, 4>,
    /// [batch_size]
    pub targets: Tensor<B, 1, Int>,
}

/// バッチャー
///
/// 正規化は必ずここで契約を通して行います。
#[derive(Clone, Debug)]
pub struct SampleBatcher<B: Backend> {
    device: B::Device,
    contract: NormalizationContract,
}

impl<B: Backend> SampleBatcher<B> {
    pub fn new(device: B::Device, contract: NormalizationContract) -> Self {
        Self { device, contract }
    }
}

impl<B: Backend> Batcher<B, Sample, SampleBatch<B>> for SampleBatcher<B> {
    fn batch(&self, items: Vec<Sample>, _device: &B::Device) -> SampleBatch<B> {
        let batch_size = items.len();
        let mut all_pixels = Vec::with_capacity(batch_size * PIXELS);
        let mut targets = Vec::with_capacity(batch_size);

        for item in items {
            all_pixels.extend_from_slice(self.contract.normalize(&item.image).values());
            targets.push(item.label as i64);
        }

        // 1回の転送でバッチ全体をデバイスへ
        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), &self.device).reshape([
            batch_size,
            CHANNELS,
            IMAGE_HEIGHT,
            IMAGE_WIDTH,
        ]);
        let targets = Tensor::<B, 1, Int>::from_ints(targets.as_slice(), &self.device);

        SampleBatch { images, targets }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use std::io::Write;

    fn idx_images(count: u32, rows: u32, cols: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&IMAGES_MAGIC.to_be_bytes());
        bytes.extend_from_slice(&count.to_be_bytes());
        bytes.extend_from_slice(&rows.to_be_bytes());
        bytes.extend_from_slice(&cols.to_be_bytes());
        for i in 0..count * rows * cols {
            bytes.push((i % 251) as u8);
        }
        bytes
    }

    fn idx_labels(labels: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&LABELS_MAGIC.to_be_bytes());
        bytes.extend_from_slice(&(labels.len() as u32).to_be_bytes());
        bytes.extend_from_slice(labels);
        bytes
    }

    #[test]
    fn test_from_idx_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("t10k-images-idx3-ubyte"), idx_images(3, 28, 28)).unwrap();
        std::fs::write(dir.path().join("t10k-labels-idx1-ubyte"), idx_labels(&[4, 0, 9])).unwrap();

        let dataset = SampleDataset::from_idx_dir(dir.path(), Split::Test).unwrap();
        assert_eq!(dataset.len(), 3);

        let first = dataset.get(0).unwrap();
        assert_eq!(first.label, 4);
        assert_eq!(first.image.pixels()[30], 30);
        assert_eq!(dataset.get(2).unwrap().label, 9);
        assert!(dataset.get(3).is_none());
    }

    #[test]
    fn test_from_idx_dir_gzip() {
        let dir = tempfile::tempdir().unwrap();
        for (name, bytes) in [
            ("train-images-idx3-ubyte.gz", idx_images(2, 28, 28)),
            ("train-labels-idx1-ubyte.gz", idx_labels(&[1, 2])),
        ] {
            let file = File::create(dir.path().join(name)).unwrap();
            let mut encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            encoder.write_all(&bytes).unwrap();
            encoder.finish().unwrap();
        }

        let dataset = SampleDataset::from_idx_dir(dir.path(), Split::Train).unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.get(1).unwrap().label, 2);
    }

    #[test]
    fn test_from_idx_dir_rejects_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("t10k-images-idx3-ubyte"), idx_images(2, 32, 32)).unwrap();
        std::fs::write(dir.path().join("t10k-labels-idx1-ubyte"), idx_labels(&[0, 1])).unwrap();
        assert!(SampleDataset::from_idx_dir(dir.path(), Split::Test).is_err());

        std::fs::write(dir.path().join("t10k-images-idx3-ubyte"), idx_images(2, 28, 28)).unwrap();
        std::fs::write(dir.path().join("t10k-labels-idx1-ubyte"), idx_labels(&[0, 12])).unwrap();
        assert!(SampleDataset::from_idx_dir(dir.path(), Split::Test).is_err());

        std::fs::write(dir.path().join("t10k-labels-idx1-ubyte"), idx_labels(&[0])).unwrap();
        assert!(SampleDataset::from_idx_dir(dir.path(), Split::Test).is_err());
    }

    #[test]
    fn test_synthetic_is_balanced() {
        let dataset = SampleDataset::synthetic(5, 7);
        assert_eq!(dataset.len(), 5 * NUM_CLASSES);

        for label in 0..NUM_CLASSES {
            let count = (0..dataset.len())
                .filter_map(|i| dataset.get(i))
                .filter(|s| s.label == label)
                .count();
            assert_eq!(count, 5);
        }
    }

    #[test]
    fn test_batcher_keeps_pairing() {
        let device: <NdArray as burn::tensor::backend::Backend>::Device = Default::default();
        let dataset = SampleDataset::synthetic(1, 3);
        let items: Vec<Sample> = (0..4).filter_map(|i| dataset.get(i)).collect();
        let labels: Vec<i64> = items.iter().map(|s| s.label as i64).collect();

        let batcher =
            SampleBatcher::<NdArray>::new(device.clone(), NormalizationContract::default());
        let batch = batcher.batch(items, &device);

        assert_eq!(batch.images.dims(), [4, 1, 28, 28]);
        let targets = batch
            .targets
            .into_data()
            .convert::<i64>()
            .to_vec::<i64>()
            .unwrap();
        assert_eq!(targets, labels);
    }
}
