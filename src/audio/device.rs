//! Owns the cpal streams on a dedicated OS thread.
//!
//! cpal streams are not `Send`, so they live on one worker thread for their
//! whole life. The async world talks to the thread over a std mpsc command
//! channel; the thread is joined on drop. Stream callbacks touch only the
//! shared pipeline buffers and log errors instead of propagating them.

use super::{PipelineBuffers, INPUT_FRAME_SAMPLES, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
use crate::error::{Result, VoxError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use std::sync::mpsc;
use std::sync::Arc;

enum DeviceCommand {
    ReinitInput,
    ReinitOutput,
    Shutdown,
}

pub(crate) struct DeviceWorker {
    commands: mpsc::Sender<DeviceCommand>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl DeviceWorker {
    pub(crate) fn start(buffers: Arc<PipelineBuffers>) -> Result<Self> {
        let (commands, command_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();

        let thread = std::thread::Builder::new()
            .name("audio-device".to_string())
            .spawn(move || {
                let mut input = match build_input_stream(&buffers) {
                    Ok(stream) => Some(stream),
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let mut output = match build_output_stream(&buffers) {
                    Ok(stream) => Some(stream),
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                for command in command_rx.iter() {
                    match command {
                        DeviceCommand::ReinitInput => {
                            input = None;
                            match build_input_stream(&buffers) {
                                Ok(stream) => {
                                    log::info!("input stream reinitialized");
                                    input = Some(stream);
                                }
                                Err(e) => log::error!("input stream reinit failed: {e}"),
                            }
                        }
                        DeviceCommand::ReinitOutput => {
                            output = None;
                            match build_output_stream(&buffers) {
                                Ok(stream) => {
                                    log::info!("output stream reinitialized");
                                    output = Some(stream);
                                }
                                Err(e) => log::error!("output stream reinit failed: {e}"),
                            }
                        }
                        DeviceCommand::Shutdown => break,
                    }
                }
                drop(input);
                drop(output);
            })
            .map_err(|e| VoxError::Audio(format!("failed to spawn audio thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(DeviceWorker {
                commands,
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(VoxError::Audio("audio thread exited during startup".to_string()))
            }
        }
    }

    pub(crate) fn reinitialize(&self, is_input: bool) -> Result<()> {
        let command = if is_input {
            DeviceCommand::ReinitInput
        } else {
            DeviceCommand::ReinitOutput
        };
        self.commands
            .send(command)
            .map_err(|_| VoxError::Audio("audio device worker stopped".to_string()))
    }
}

impl Drop for DeviceWorker {
    fn drop(&mut self) {
        let _ = self.commands.send(DeviceCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("audio device thread panicked");
            }
        }
    }
}

fn build_input_stream(buffers: &Arc<PipelineBuffers>) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| VoxError::Audio("no input device available".to_string()))?;
    let sample_format = device
        .default_input_config()
        .map_err(|e| VoxError::Audio(format!("no input config: {e}")))?
        .sample_format();
    let config = cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(INPUT_SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = match sample_format {
        cpal::SampleFormat::I16 => build_input_for::<i16>(&device, &config, buffers)?,
        cpal::SampleFormat::F32 => build_input_for::<f32>(&device, &config, buffers)?,
        cpal::SampleFormat::U16 => build_input_for::<u16>(&device, &config, buffers)?,
        other => {
            return Err(VoxError::Audio(format!(
                "unsupported input sample format {other}"
            )))
        }
    };
    stream
        .play()
        .map_err(|e| VoxError::Audio(format!("failed to start input stream: {e}")))?;
    Ok(stream)
}

fn build_input_for<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    buffers: &Arc<PipelineBuffers>,
) -> Result<cpal::Stream>
where
    T: SizedSample,
    i16: FromSample<T>,
{
    let buffers = Arc::clone(buffers);
    let mut pending: Vec<i16> = Vec::with_capacity(INPUT_FRAME_SAMPLES);
    device
        .build_input_stream(
            config,
            move |data: &[T], _| {
                for sample in data {
                    pending.push(i16::from_sample(*sample));
                    if pending.len() == INPUT_FRAME_SAMPLES {
                        buffers.push_capture(std::mem::replace(
                            &mut pending,
                            Vec::with_capacity(INPUT_FRAME_SAMPLES),
                        ));
                    }
                }
            },
            |err| log::debug!("input stream error: {err}"),
            None,
        )
        .map_err(|e| VoxError::Audio(format!("failed to build input stream: {e}")))
}

fn build_output_stream(buffers: &Arc<PipelineBuffers>) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| VoxError::Audio("no output device available".to_string()))?;
    let sample_format = device
        .default_output_config()
        .map_err(|e| VoxError::Audio(format!("no output config: {e}")))?
        .sample_format();
    let config = cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(OUTPUT_SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = match sample_format {
        cpal::SampleFormat::I16 => build_output_for::<i16>(&device, &config, buffers)?,
        cpal::SampleFormat::F32 => build_output_for::<f32>(&device, &config, buffers)?,
        cpal::SampleFormat::U16 => build_output_for::<u16>(&device, &config, buffers)?,
        other => {
            return Err(VoxError::Audio(format!(
                "unsupported output sample format {other}"
            )))
        }
    };
    stream
        .play()
        .map_err(|e| VoxError::Audio(format!("failed to start output stream: {e}")))?;
    Ok(stream)
}

fn build_output_for<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    buffers: &Arc<PipelineBuffers>,
) -> Result<cpal::Stream>
where
    T: SizedSample + FromSample<i16>,
{
    let buffers = Arc::clone(buffers);
    let mut scratch: Vec<i16> = Vec::new();
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _| {
                scratch.resize(data.len(), 0);
                buffers.fill_playback(&mut scratch);
                for (slot, sample) in data.iter_mut().zip(scratch.iter()) {
                    *slot = T::from_sample(*sample);
                }
            },
            |err| log::debug!("output stream error: {err}"),
            None,
        )
        .map_err(|e| VoxError::Audio(format!("failed to build output stream: {e}")))
}
