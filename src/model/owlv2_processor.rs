// 该文件是 Tianmu （天目） 项目的一部分。
// src/model/owlv2_processor.rs - OWLv2 前处理与后处理
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::path::Path;

use image::imageops::{self, FilterType};
use image::{Rgb, Rgb32FImage, RgbImage};
use ndarray::{Array2, ArrayD};
use serde::Deserialize;
use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer};
use tracing::{debug, info};

use crate::frame::to_normalized_nchw;
use crate::model::{Detection, Owlv2Error, round2};

const OWLV2_IMAGE_SIZE: u32 = 960;
const OWLV2_IMAGE_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const OWLV2_IMAGE_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];
const OWLV2_RESCALE_FACTOR: f32 = 1.0 / 255.0;
const OWLV2_PAD_VALUE: f32 = 0.5;
const OWLV2_MAX_TEXT_LENGTH: usize = 16;
const OWLV2_PAD_TOKEN: &str = "!";

#[derive(Debug, Deserialize)]
#[serde(default)]
struct PreprocessorConfig {
  image_mean: [f32; 3],
  image_std: [f32; 3],
  rescale_factor: f32,
  size: ImageSize,
}

#[derive(Debug, Deserialize)]
struct ImageSize {
  height: u32,
}

impl Default for PreprocessorConfig {
  fn default() -> Self {
    Self {
      image_mean: OWLV2_IMAGE_MEAN,
      image_std: OWLV2_IMAGE_STD,
      rescale_factor: OWLV2_RESCALE_FACTOR,
      size: ImageSize {
        height: OWLV2_IMAGE_SIZE,
      },
    }
  }
}

/// 网络的三个输入
#[derive(Debug, Clone)]
pub struct Owlv2Inputs {
  pub input_ids: ArrayD<i64>,
  pub attention_mask: ArrayD<i64>,
  pub pixel_values: ArrayD<f32>,
}

/// 单张图像的原始输出：`logits` 为 (框, 提示词)，`pred_boxes` 为 (框, 4) 的归一化 cx/cy/w/h
#[derive(Debug, Clone)]
pub struct Owlv2Outputs {
  pub logits: Array2<f32>,
  pub pred_boxes: Array2<f32>,
}

/// 文本与图像的配对预处理器
pub struct Owlv2Processor {
  tokenizer: Tokenizer,
  image_size: u32,
  image_mean: [f32; 3],
  image_std: [f32; 3],
  rescale_factor: f32,
  max_length: usize,
}

impl Owlv2Processor {
  /// 分词器的截断与填充固定为 16 个 token，特殊 token 由其后处理器添加
  pub fn new(mut tokenizer: Tokenizer) -> Result<Self, Owlv2Error> {
    let mut truncation = tokenizer.get_truncation().cloned().unwrap_or_default();
    truncation.max_length = OWLV2_MAX_TEXT_LENGTH;
    tokenizer
      .with_truncation(Some(truncation))
      .map_err(|e| Owlv2Error::TokenizerError(e.to_string()))?;

    let mut padding = tokenizer.get_padding().cloned().unwrap_or_else(|| {
      let pad_id = tokenizer.token_to_id(OWLV2_PAD_TOKEN).unwrap_or(0);
      PaddingParams {
        pad_id,
        pad_token: tokenizer
          .id_to_token(pad_id)
          .unwrap_or_else(|| OWLV2_PAD_TOKEN.to_string()),
        ..Default::default()
      }
    });
    padding.strategy = PaddingStrategy::Fixed(OWLV2_MAX_TEXT_LENGTH);
    tokenizer.with_padding(Some(padding));

    let config = PreprocessorConfig::default();
    Ok(Self {
      tokenizer,
      image_size: config.size.height,
      image_mean: config.image_mean,
      image_std: config.image_std,
      rescale_factor: config.rescale_factor,
      max_length: OWLV2_MAX_TEXT_LENGTH,
    })
  }

  /// 读取 `tokenizer.json` 与 `preprocessor_config.json`
  pub fn from_files(
    tokenizer_path: impl AsRef<Path>,
    preprocessor_path: impl AsRef<Path>,
  ) -> Result<Self, Owlv2Error> {
    let tokenizer_path = tokenizer_path.as_ref();
    info!("加载分词器: {}", tokenizer_path.display());
    let tokenizer =
      Tokenizer::from_file(tokenizer_path).map_err(|e| Owlv2Error::TokenizerError(e.to_string()))?;

    let preprocessor_path = preprocessor_path.as_ref();
    let config: PreprocessorConfig = if preprocessor_path.exists() {
      serde_json::from_str(&std::fs::read_to_string(preprocessor_path)?)?
    } else {
      debug!("预处理配置不存在, 使用默认值: {}", preprocessor_path.display());
      PreprocessorConfig::default()
    };

    let mut processor = Self::new(tokenizer)?;
    processor.image_size = config.size.height;
    processor.image_mean = config.image_mean;
    processor.image_std = config.image_std;
    processor.rescale_factor = config.rescale_factor;
    Ok(processor)
  }

  pub fn with_image_size(mut self, image_size: u32) -> Self {
    self.image_size = image_size;
    self
  }

  pub fn image_size(&self) -> u32 {
    self.image_size
  }

  /// 提示词批量编码为定长 `input_ids` 与 `attention_mask`
  pub fn tokenize(&self, prompts: &[String]) -> Result<(Array2<i64>, Array2<i64>), Owlv2Error> {
    let batch: Vec<&str> = prompts.iter().map(String::as_str).collect();
    let encodings = self
      .tokenizer
      .encode_batch(batch, true)
      .map_err(|e| Owlv2Error::TokenizerError(e.to_string()))?;

    let shape = (prompts.len(), self.max_length);
    let ids: Vec<i64> = encodings
      .iter()
      .flat_map(|encoding| encoding.get_ids().iter().map(|&id| id as i64))
      .collect();
    let mask: Vec<i64> = encodings
      .iter()
      .flat_map(|encoding| encoding.get_attention_mask().iter().map(|&m| m as i64))
      .collect();
    let input_ids = Array2::from_shape_vec(shape, ids)?;
    let attention_mask = Array2::from_shape_vec(shape, mask)?;

    Ok((input_ids, attention_mask))
  }

  /// 右下方向补成正方形，缩放到输入尺寸后归一化
  pub fn preprocess_image(&self, image: &RgbImage) -> ArrayD<f32> {
    let (width, height) = image.dimensions();
    let side = width.max(height);

    let rescale = self.rescale_factor;
    let scaled = Rgb32FImage::from_fn(width, height, |x, y| {
      let pixel = image.get_pixel(x, y);
      Rgb([
        pixel[0] as f32 * rescale,
        pixel[1] as f32 * rescale,
        pixel[2] as f32 * rescale,
      ])
    });
    let mut canvas = Rgb32FImage::from_pixel(side, side, Rgb([OWLV2_PAD_VALUE; 3]));
    imageops::replace(&mut canvas, &scaled, 0, 0);

    let resized = imageops::resize(&canvas, self.image_size, self.image_size, FilterType::Triangle);
    to_normalized_nchw(&resized, self.image_mean, self.image_std).into_dyn()
  }

  pub fn preprocess(&self, image: &RgbImage, prompts: &[String]) -> Result<Owlv2Inputs, Owlv2Error> {
    let (input_ids, attention_mask) = self.tokenize(prompts)?;
    Ok(Owlv2Inputs {
      input_ids: input_ids.into_dyn(),
      attention_mask: attention_mask.into_dyn(),
      pixel_values: self.preprocess_image(image),
    })
  }

  /// 解码检测框：每个框取得分最高的提示词，分数超过阈值才保留。
  ///
  /// 框坐标相对补齐后的正方形，换算回像素后裁剪到原图范围内。
  pub fn post_process(
    &self,
    outputs: &Owlv2Outputs,
    prompts: &[String],
    (width, height): (u32, u32),
    threshold: f32,
  ) -> Result<Vec<Detection>, Owlv2Error> {
    let Owlv2Outputs { logits, pred_boxes } = outputs;
    if pred_boxes.ncols() != 4 || logits.nrows() != pred_boxes.nrows() {
      return Err(Owlv2Error::OutputShape(format!(
        "logits {:?} 与 pred_boxes {:?} 不匹配",
        logits.shape(),
        pred_boxes.shape()
      )));
    }
    if logits.ncols() != prompts.len() {
      return Err(Owlv2Error::OutputShape(format!(
        "logits 有 {} 列, 提示词 {} 个",
        logits.ncols(),
        prompts.len()
      )));
    }

    let side = width.max(height) as f32;
    let (width, height) = (width as f32, height as f32);
    let mut detections = Vec::new();

    for (scores, bbox) in logits.rows().into_iter().zip(pred_boxes.rows()) {
      let (label, logit) = scores
        .iter()
        .enumerate()
        .fold((0usize, f32::NEG_INFINITY), |best, (i, &v)| {
          if v > best.1 { (i, v) } else { best }
        });
      let score = sigmoid(logit);
      if score <= threshold {
        continue;
      }

      let (cx, cy, w, h) = (bbox[0], bbox[1], bbox[2], bbox[3]);
      let xmin = ((cx - 0.5 * w) * side).clamp(0.0, width);
      let ymin = ((cy - 0.5 * h) * side).clamp(0.0, height);
      let xmax = ((cx + 0.5 * w) * side).clamp(0.0, width);
      let ymax = ((cy + 0.5 * h) * side).clamp(0.0, height);

      detections.push(Detection {
        label: prompts[label].clone(),
        score,
        bbox: [round2(xmin), round2(ymin), round2(xmax), round2(ymax)],
      });
    }

    debug!("检测到 {} 个物体", detections.len());
    Ok(detections)
  }
}

fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use ndarray::array;
  use std::str::FromStr;

  pub(crate) const WORD_LEVEL_TOKENIZER: &str = r#"{
    "version": "1.0",
    "truncation": null,
    "padding": null,
    "added_tokens": [],
    "normalizer": null,
    "pre_tokenizer": {"type": "Whitespace"},
    "post_processor": null,
    "decoder": null,
    "model": {
      "type": "WordLevel",
      "vocab": {"!": 0, "a": 1, "car": 2, "screw": 3, "shark": 4, "<unk>": 5},
      "unk_token": "<unk>"
    }
  }"#;

  pub(crate) fn processor() -> Owlv2Processor {
    let tokenizer = Tokenizer::from_str(WORD_LEVEL_TOKENIZER).unwrap();
    Owlv2Processor::new(tokenizer).unwrap().with_image_size(32)
  }

  fn prompts(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
  }

  #[test]
  fn prompts_are_padded_to_fixed_length() {
    let (ids, mask) = processor().tokenize(&prompts(&["a car", "screw"])).unwrap();
    assert_eq!(ids.shape(), &[2, OWLV2_MAX_TEXT_LENGTH]);
    assert_eq!(ids.row(0).iter().take(3).copied().collect::<Vec<_>>(), vec![1, 2, 0]);
    assert_eq!(ids[[1, 0]], 3);
    assert_eq!(mask.row(0).sum(), 2);
    assert_eq!(mask.row(1).sum(), 1);
  }

  #[test]
  fn long_prompts_are_truncated() {
    let long = vec!["a"; 40].join(" ");
    let (ids, mask) = processor().tokenize(&[long]).unwrap();
    assert_eq!(ids.shape(), &[1, OWLV2_MAX_TEXT_LENGTH]);
    assert_eq!(mask.sum(), OWLV2_MAX_TEXT_LENGTH as i64);
  }

  const TEMPLATE_TOKENIZER: &str = r#"{
    "version": "1.0",
    "truncation": null,
    "padding": null,
    "added_tokens": [],
    "normalizer": null,
    "pre_tokenizer": {"type": "Whitespace"},
    "post_processor": {
      "type": "TemplateProcessing",
      "single": [
        {"SpecialToken": {"id": "<s>", "type_id": 0}},
        {"Sequence": {"id": "A", "type_id": 0}},
        {"SpecialToken": {"id": "</s>", "type_id": 0}}
      ],
      "pair": [
        {"SpecialToken": {"id": "<s>", "type_id": 0}},
        {"Sequence": {"id": "A", "type_id": 0}},
        {"SpecialToken": {"id": "</s>", "type_id": 0}},
        {"Sequence": {"id": "B", "type_id": 1}},
        {"SpecialToken": {"id": "</s>", "type_id": 1}}
      ],
      "special_tokens": {
        "<s>": {"id": "<s>", "ids": [6], "tokens": ["<s>"]},
        "</s>": {"id": "</s>", "ids": [7], "tokens": ["</s>"]}
      }
    },
    "decoder": null,
    "model": {
      "type": "WordLevel",
      "vocab": {"!": 0, "a": 1, "car": 2, "screw": 3, "shark": 4, "<unk>": 5, "<s>": 6, "</s>": 7},
      "unk_token": "<unk>"
    }
  }"#;

  #[test]
  fn special_tokens_survive_truncation() {
    let tokenizer = Tokenizer::from_str(TEMPLATE_TOKENIZER).unwrap();
    let processor = Owlv2Processor::new(tokenizer).unwrap();
    let long = vec!["a"; 40].join(" ");
    let (ids, mask) = processor
      .tokenize(&prompts(&["a car", long.as_str()]))
      .unwrap();

    assert_eq!(ids.shape(), &[2, OWLV2_MAX_TEXT_LENGTH]);
    assert_eq!(ids.row(0).iter().take(5).copied().collect::<Vec<_>>(), vec![6, 1, 2, 7, 0]);
    assert_eq!(mask.row(0).sum(), 4);

    assert_eq!(ids[[1, 0]], 6);
    assert_eq!(ids[[1, OWLV2_MAX_TEXT_LENGTH - 1]], 7);
    assert_eq!(mask.row(1).sum(), OWLV2_MAX_TEXT_LENGTH as i64);
  }

  #[test]
  fn image_is_padded_to_square_before_resize() {
    let image = RgbImage::from_pixel(8, 4, Rgb([255, 255, 255]));
    let pixels = processor().preprocess_image(&image);
    assert_eq!(pixels.shape(), &[1, 3, 32, 32]);

    let white = (1.0 - OWLV2_IMAGE_MEAN[0]) / OWLV2_IMAGE_STD[0];
    let gray = (OWLV2_PAD_VALUE - OWLV2_IMAGE_MEAN[0]) / OWLV2_IMAGE_STD[0];
    assert!((pixels[[0, 0, 2, 2]] - white).abs() < 1e-4);
    assert!((pixels[[0, 0, 30, 2]] - gray).abs() < 1e-4);
  }

  #[test]
  fn detections_below_threshold_are_dropped() {
    let outputs = Owlv2Outputs {
      logits: array![[2.0, -4.0], [-6.0, -5.0], [-3.0, 0.5]],
      pred_boxes: array![[0.25, 0.25, 0.2, 0.2], [0.5, 0.5, 0.1, 0.1], [0.5, 0.5, 0.5, 0.5]],
    };
    let detections = processor()
      .post_process(&outputs, &prompts(&["car", "screw"]), (100, 100), 0.1)
      .unwrap();

    assert_eq!(detections.len(), 2);
    assert!(detections.iter().all(|d| d.score > 0.1));
    assert_eq!(detections[0].label, "car");
    assert_eq!(detections[0].bbox, [15.0, 15.0, 35.0, 35.0]);
    assert_eq!(detections[1].label, "screw");
  }

  #[test]
  fn boxes_scale_with_padded_side_and_stay_in_bounds() {
    let outputs = Owlv2Outputs {
      logits: array![[3.0]],
      pred_boxes: array![[0.5, 0.5, 1.2, 1.2]],
    };
    let detections = processor()
      .post_process(&outputs, &prompts(&["shark"]), (200, 100), 0.1)
      .unwrap();

    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0].bbox, [0.0, 0.0, 200.0, 100.0]);
  }

  #[test]
  fn bbox_coordinates_are_rounded() {
    let outputs = Owlv2Outputs {
      logits: array![[3.0]],
      pred_boxes: array![[0.123_456, 0.3, 0.1, 0.1]],
    };
    let detections = processor()
      .post_process(&outputs, &prompts(&["car"]), (100, 100), 0.1)
      .unwrap();
    let bbox = detections[0].bbox;
    for value in bbox {
      assert_eq!(value, round2(value));
    }
  }

  #[test]
  fn mismatched_output_shapes_are_errors() {
    let outputs = Owlv2Outputs {
      logits: array![[1.0, 2.0]],
      pred_boxes: array![[0.5, 0.5, 0.1, 0.1]],
    };
    assert!(matches!(
      processor().post_process(&outputs, &prompts(&["car"]), (10, 10), 0.1),
      Err(Owlv2Error::OutputShape(_))
    ));
  }
}
