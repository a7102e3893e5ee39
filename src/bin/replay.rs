// 该文件是 Xiling （西岭） 项目的一部分。
// src/bin/replay.rs - 回放记录的模型输出并解码
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Parser;
use url::Url;

use tracing::info;
use xiling::{
  Detector, FromUrl,
  frame::{PreparedFrame, SourceSize},
  model::ModelSource,
  output::OutputWrapper,
  runtime::{Manifest, ReplayLoader},
  task::{ContinuousTask, OneShotTask, Task},
};

/// Xiling 输出回放工具
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型地址，路径指向回放清单，例如 yolo:///data/manifest.json?config=yolov8_640
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输出地址: log:// 或 jsonl:///path/result.jsonl
  #[arg(long, value_name = "OUTPUT", default_value = "log://")]
  pub output: Url,
  /// 原图宽度，缺省时使用清单中的记录
  #[arg(long, value_name = "WIDTH")]
  pub source_width: Option<u32>,
  /// 原图高度，缺省时使用清单中的记录
  #[arg(long, value_name = "HEIGHT")]
  pub source_height: Option<u32>,
  /// 连续回放的帧数，缺省时只回放一帧
  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<usize>,
  /// 在该图像上绘制检测结果
  #[cfg(feature = "draw")]
  #[arg(long, value_name = "IMAGE")]
  pub image: Option<PathBuf>,
  /// 绘制结果的保存路径
  #[cfg(feature = "draw")]
  #[arg(long, value_name = "FILE", requires = "image")]
  pub save: Option<PathBuf>,
  /// 标签字体文件
  #[cfg(feature = "draw")]
  #[arg(long, value_name = "FONT")]
  pub font: Option<PathBuf>,
  /// 标签字号
  #[cfg(feature = "draw")]
  #[arg(long, value_name = "SIZE", default_value_t = 20.0)]
  pub font_size: f32,
}

fn source_size(args: &Args, model_path: &Path) -> Result<SourceSize> {
  let recorded = Manifest::from_file(model_path)?.source;
  let width = args.source_width.or(recorded.map(|s| s.width));
  let height = args.source_height.or(recorded.map(|s| s.height));
  match (width, height) {
    (Some(width), Some(height)) => Ok(SourceSize::new(width, height)),
    _ => anyhow::bail!("未指定原图尺寸，清单中也没有记录"),
  }
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型地址: {}", args.model);
  info!("输出地址: {}", args.output);

  let source = ModelSource::from_url(&args.model)?;
  let source_size = source_size(&args, &source.model_path)?;
  let (width, height) = (source.config.input_width, source.config.input_height);
  info!("原图尺寸: {}x{}", source_size.width, source_size.height);

  let detector = Detector::new();
  detector.load(&ReplayLoader, &source)?;

  let output = OutputWrapper::from_url(&args.output)?;
  let frames = std::iter::repeat_with(move || PreparedFrame::blank(width, height, source_size))
    .map_while(Result::ok);

  match args.frame_number {
    Some(n) => ContinuousTask::default()
      .with_frame_number(Some(n))
      .run_task(frames, detector.clone(), output)?,
    None => OneShotTask::default().run_task(frames, detector.clone(), output)?,
  }

  #[cfg(feature = "draw")]
  if let (Some(image_path), Some(save_path)) = (&args.image, &args.save) {
    let mut image = image::open(image_path)?.to_rgb8();
    let mut draw = xiling::output::draw::Draw::default().with_font_size(args.font_size);
    if let Some(font) = &args.font {
      draw = draw.with_font_file(font)?;
    }
    draw.draw_detections(&mut image, &detector.latest());
    image.save(save_path)?;
    info!("绘制结果已保存: {}", save_path.display());
  }

  Ok(())
}
