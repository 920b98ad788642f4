//! Render command builder.

use std::path::{Path, PathBuf};

use vrender_models::RenderJob;

use crate::error::{MediaError, MediaResult};

/// Builder for the AI video generation command line.
#[derive(Debug, Clone)]
pub struct GenerationCommand {
    /// Generator executable
    program: PathBuf,
    /// Text prompt
    prompt: String,
    /// Output clip path
    output: PathBuf,
    /// Optional conditioning image
    input_image: Option<PathBuf>,
    duration_secs: u32,
    fps: u32,
    width: u32,
    height: u32,
    steps: u32,
    guidance_scale: f32,
    seed: Option<u64>,
    /// GPU chosen by the ledger
    device: Option<u32>,
    /// Memory the ledger reserved for this process
    memory_budget_mb: Option<u64>,
    /// Passed through verbatim after the generated flags
    extra_args: Vec<String>,
    env: Vec<(String, String)>,
}

impl GenerationCommand {
    /// Create a new generation command.
    pub fn new(
        program: impl AsRef<Path>,
        prompt: impl Into<String>,
        output: impl AsRef<Path>,
    ) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            prompt: prompt.into(),
            output: output.as_ref().to_path_buf(),
            input_image: None,
            duration_secs: 5,
            fps: 24,
            width: 576,
            height: 1024,
            steps: 30,
            guidance_scale: 7.5,
            seed: None,
            device: None,
            memory_budget_mb: None,
            extra_args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Create a command carrying every generation setting of `job`.
    pub fn from_job(program: impl AsRef<Path>, job: &RenderJob) -> Self {
        let mut cmd = Self::new(program, job.prompt.clone(), &job.output_path)
            .duration(job.duration_secs)
            .fps(job.fps)
            .resolution(job.resolution.width, job.resolution.height)
            .steps(job.quality.steps)
            .guidance_scale(job.quality.guidance_scale);
        if let Some(image) = &job.input_image {
            cmd = cmd.input_image(image);
        }
        if let Some(seed) = job.quality.seed {
            cmd = cmd.seed(seed);
        }
        cmd
    }

    /// Replace the output clip path.
    pub fn output_path(mut self, path: impl AsRef<Path>) -> Self {
        self.output = path.as_ref().to_path_buf();
        self
    }

    /// Set the conditioning image.
    pub fn input_image(mut self, path: impl AsRef<Path>) -> Self {
        self.input_image = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set clip duration.
    pub fn duration(mut self, seconds: u32) -> Self {
        self.duration_secs = seconds;
        self
    }

    pub fn fps(mut self, fps: u32) -> Self {
        self.fps = fps;
        self
    }

    pub fn resolution(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set sampling steps.
    pub fn steps(mut self, steps: u32) -> Self {
        self.steps = steps;
        self
    }

    pub fn guidance_scale(mut self, scale: f32) -> Self {
        self.guidance_scale = scale;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Pin the process to one GPU.
    pub fn device(mut self, index: u32) -> Self {
        self.device = Some(index);
        self
    }

    /// Cap the process's VRAM use to what the ledger reserved.
    pub fn memory_budget_mb(mut self, mb: u64) -> Self {
        self.memory_budget_mb = Some(mb);
        self
    }

    /// Add an extra argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    /// Add multiple extra arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Build the command arguments.
    pub fn build_args(&self) -> Vec<String> {
        let mut args = vec![
            "--prompt".to_string(),
            self.prompt.clone(),
            "--output".to_string(),
            self.output.to_string_lossy().to_string(),
        ];

        if let Some(image) = &self.input_image {
            args.push("--input-image".to_string());
            args.push(image.to_string_lossy().to_string());
        }

        args.push("--duration".to_string());
        args.push(self.duration_secs.to_string());
        args.push("--fps".to_string());
        args.push(self.fps.to_string());
        args.push("--width".to_string());
        args.push(self.width.to_string());
        args.push("--height".to_string());
        args.push(self.height.to_string());
        args.push("--steps".to_string());
        args.push(self.steps.to_string());
        args.push("--guidance-scale".to_string());
        args.push(format!("{:.2}", self.guidance_scale));

        if let Some(seed) = self.seed {
            args.push("--seed".to_string());
            args.push(seed.to_string());
        }

        // Allocation
        if let Some(device) = self.device {
            args.push("--gpu".to_string());
            args.push(device.to_string());
        }
        if let Some(mb) = self.memory_budget_mb {
            args.push("--max-vram-mb".to_string());
            args.push(mb.to_string());
        }

        args.extend(self.extra_args.clone());
        args
    }

    /// Build the environment for the child process.
    pub fn build_env(&self) -> Vec<(String, String)> {
        let mut env = Vec::new();

        if let Some(device) = self.device {
            // nvidia-smi indexes by PCI bus; make CUDA agree
            env.push(("CUDA_DEVICE_ORDER".to_string(), "PCI_BUS_ID".to_string()));
            env.push(("CUDA_VISIBLE_DEVICES".to_string(), device.to_string()));
        }

        env.extend(self.env.clone());
        env
    }
}

/// Check that the render command can be executed.
pub fn check_render_command(program: impl AsRef<Path>) -> MediaResult<PathBuf> {
    let program = program.as_ref();
    which::which(program)
        .map_err(|_| MediaError::RenderCommandNotFound(program.display().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vrender_models::RenderJob;

    #[test]
    fn test_command_builder() {
        let cmd = GenerationCommand::new("generate-video", "a fox in snow", "/tmp/fox.mp4")
            .duration(8)
            .seed(42)
            .device(1)
            .memory_budget_mb(6144)
            .arg("--fp16");

        let args = cmd.build_args();
        let pos = |flag: &str| args.iter().position(|a| a == flag).unwrap();

        assert_eq!(args[pos("--prompt") + 1], "a fox in snow");
        assert_eq!(args[pos("--duration") + 1], "8");
        assert_eq!(args[pos("--seed") + 1], "42");
        assert_eq!(args[pos("--gpu") + 1], "1");
        assert_eq!(args[pos("--max-vram-mb") + 1], "6144");
        assert_eq!(args[pos("--guidance-scale") + 1], "7.50");
        assert_eq!(args.last().map(String::as_str), Some("--fp16"));
        assert!(!args.contains(&"--input-image".to_string()));
    }

    #[test]
    fn test_env_pins_device() {
        let cmd = GenerationCommand::new("gen", "p", "/tmp/o.mp4")
            .device(2)
            .env("HF_HOME", "/models");
        let env = cmd.build_env();

        assert!(env.contains(&("CUDA_VISIBLE_DEVICES".to_string(), "2".to_string())));
        assert!(env.contains(&("HF_HOME".to_string(), "/models".to_string())));

        let unpinned = GenerationCommand::new("gen", "p", "/tmp/o.mp4").build_env();
        assert!(unpinned.is_empty());
    }

    #[test]
    fn test_from_job() {
        let job = RenderJob::new("u", "city lights", "/tmp/city.mp4", 4096)
            .with_input_image("/tmp/ref.png")
            .with_duration(3);
        let args = GenerationCommand::from_job("gen", &job).build_args();

        assert!(args.contains(&"/tmp/ref.png".to_string()));
        assert!(args.contains(&"/tmp/city.mp4".to_string()));
        assert!(args.contains(&"3".to_string()));
        assert!(!args.contains(&"--gpu".to_string()));

        let moved = GenerationCommand::from_job("gen", &job).output_path("/work/city.mp4");
        assert_eq!(moved.output(), std::path::Path::new("/work/city.mp4"));
    }

    #[test]
    fn test_check_missing_command() {
        assert!(matches!(
            check_render_command("definitely-not-a-real-generator"),
            Err(MediaError::RenderCommandNotFound(_))
        ));
    }
}
