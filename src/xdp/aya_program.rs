use std::path::PathBuf;
use anyhow::{anyhow, Context};
use aya::Ebpf;
use aya::maps::perf::AsyncPerfEventArray;
use aya::programs::{Xdp, XdpFlags};
use aya::programs::xdp::XdpLinkId;
use aya::util::online_cpus;
use bytes::BytesMut;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use crate::config::XdpConfig;
use crate::xdp::KernelProgram;

const BUFFERS_PER_CPU: usize = 16;
const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// [KernelProgram] backed by an eBPF object file, loaded and attached through aya
pub struct AyaXdpProgram {
    object_path: PathBuf,
    program_name: String,
    map_name: String,
    ebpf: Option<Ebpf>,
    link: Option<XdpLinkId>,
    readers: Vec<JoinHandle<()>>,
}

impl AyaXdpProgram {
    pub fn new(config: &XdpConfig) -> AyaXdpProgram {
        AyaXdpProgram {
            object_path: config.object_path.clone(),
            program_name: config.program_name.clone(),
            map_name: config.map_name.clone(),
            ebpf: None,
            link: None,
            readers: Vec::new(),
        }
    }

    fn program_mut(&mut self) -> anyhow::Result<&mut Xdp> {
        let ebpf = self.ebpf.as_mut()
            .ok_or_else(|| anyhow!("kernel program is not loaded"))?;
        let program: &mut Xdp = ebpf.program_mut(&self.program_name)
            .ok_or_else(|| anyhow!("object file contains no program '{}'", self.program_name))?
            .try_into()?;
        Ok(program)
    }
}

impl KernelProgram for AyaXdpProgram {
    fn load(&mut self) -> anyhow::Result<()> {
        let ebpf = Ebpf::load_file(&self.object_path)
            .with_context(|| format!("loading eBPF object {:?}", self.object_path))?;
        self.ebpf = Some(ebpf);
        self.program_mut()?.load()?;
        debug!("loaded XDP program '{}' from {:?}", self.program_name, self.object_path);
        Ok(())
    }

    fn start_events(&mut self, batch_size: usize) -> anyhow::Result<mpsc::Receiver<BytesMut>> {
        let ebpf = self.ebpf.as_mut()
            .ok_or_else(|| anyhow!("kernel program is not loaded"))?;
        let map = ebpf.take_map(&self.map_name)
            .ok_or_else(|| anyhow!("object file contains no map '{}'", self.map_name))?;
        let mut events = AsyncPerfEventArray::try_from(map)?;

        let (sender, receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        for cpu in online_cpus().map_err(|(_, e)| e)? {
            let mut cpu_buffer = events.open(cpu, None)?;
            let sender = sender.clone();

            self.readers.push(tokio::spawn(async move {
                let mut buffers = (0..BUFFERS_PER_CPU)
                    .map(|_| BytesMut::with_capacity(batch_size))
                    .collect::<Vec<_>>();

                loop {
                    let read = match cpu_buffer.read_events(&mut buffers).await {
                        Ok(read) => read,
                        Err(e) => {
                            error!("error reading kernel events on CPU {}: {}", cpu, e);
                            return;
                        }
                    };
                    if read.lost > 0 {
                        warn!("kernel dropped {} events on CPU {}", read.lost, cpu);
                    }

                    for buf in buffers.iter_mut().take(read.read) {
                        let record = buf.split();
                        buf.reserve(batch_size);
                        match sender.try_send(record) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => trace!("event channel is full - dropping record"),
                            Err(TrySendError::Closed(_)) => return,
                        }
                    }
                }
            }));
        }
        debug!("reading kernel events from map '{}' on {} CPUs", self.map_name, self.readers.len());
        Ok(receiver)
    }

    fn attach(&mut self, interface: &str) -> anyhow::Result<()> {
        let program = self.program_mut()?;
        let link = match program.attach(interface, XdpFlags::DRV_MODE) {
            Ok(link) => link,
            Err(e) => {
                debug!("XDP driver mode is not available on {} ({}), falling back to generic mode", interface, e);
                program.attach(interface, XdpFlags::SKB_MODE)
                    .with_context(|| format!("attaching XDP program to {}", interface))?
            }
        };
        self.link = Some(link);
        info!("attached XDP program '{}' to {}", self.program_name, interface);
        Ok(())
    }

    fn detach(&mut self) {
        if let Some(link) = self.link.take() {
            match self.program_mut() {
                Ok(program) => if let Err(e) = program.detach(link) {
                    warn!("error detaching XDP program: {}", e);
                },
                Err(e) => warn!("error detaching XDP program: {}", e),
            }
        }
    }

    fn stop_events(&mut self) {
        for reader in self.readers.drain(..) {
            reader.abort();
        }
    }

    fn close(&mut self) {
        if self.ebpf.take().is_some() {
            debug!("unloaded XDP program '{}'", self.program_name);
        }
    }
}
