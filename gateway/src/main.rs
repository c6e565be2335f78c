use std::fs::create_dir_all;
use std::path::PathBuf;
use clap::Parser;
use mr_data::cfl;
use mr_data::record::{ImageVolume, StreamItem, Waveform};
use mr_protocol::{ConfigFile, ProtocolSnapshot};
use mr_stream::{AcquisitionRouter, RouterConfig, StreamError};
use recon::{BartEngine, BartSettings};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use traj_predict::girf::GirfResponse;

mod stream;
use stream::{ReadError, StreamReader};

/// replay a recorded acquisition stream through the routing core and emit
/// reconstructed images
#[derive(clap::Parser,Debug)]
pub struct GatewayArgs {
    /// recorded acquisition stream
    pub stream:PathBuf,
    /// protocol snapshot (json)
    pub protocol:PathBuf,
    /// output directory for images
    pub output:PathBuf,
    /// measured gradient impulse response, required for gradient trajectory
    /// sources
    #[clap(short, long)]
    pub girf:Option<PathBuf>,
    /// gateway settings file, defaults apply when absent
    #[clap(short, long)]
    pub settings:Option<PathBuf>,
}

#[derive(Clone,Debug,Default,Serialize,Deserialize)]
pub struct GatewaySettings {
    pub router:RouterConfig,
    pub bart:BartSettings,
}

impl ConfigFile for GatewaySettings {
    fn file_ext() -> String {
        String::from("gateway_settings")
    }
}

#[derive(Debug,Error)]
enum GatewayError {
    #[error(transparent)]
    Protocol(#[from] mr_protocol::ProtocolError),
    #[error(transparent)]
    Settings(#[from] mr_protocol::SettingsError),
    #[error(transparent)]
    Girf(#[from] traj_predict::TrajError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    StreamFile(#[from] ReadError),
    #[error(transparent)]
    Recon(#[from] recon::ReconError),
    #[error("cannot write image: {0}")]
    Sink(#[from] mr_data::cfl::CflError),
    #[error("cannot create output directory: {0}")]
    Output(#[from] std::io::Error),
}

fn main() {
    let args = GatewayArgs::parse();
    if let Err(e) = run(&args) {
        eprintln!("gateway failed: {}",e);
        std::process::exit(1);
    }
}

fn run(args:&GatewayArgs) -> Result<(),GatewayError> {
    let snapshot = ProtocolSnapshot::from_file(&args.protocol)?;
    log::info!("protocol: {:?} trajectory, {}x{}x{} matrix, {} channels",
        snapshot.trajectory,snapshot.encoded_matrix.x,snapshot.encoded_matrix.y,
        snapshot.encoded_matrix.z,snapshot.channels);
    let settings = match &args.settings {
        Some(path) => GatewaySettings::from_file(path)?,
        None => GatewaySettings::default(),
    };
    let girf = match &args.girf {
        Some(path) => Some(GirfResponse::from_file(path)?),
        None => None,
    };
    create_dir_all(&args.output)?;

    let matrix = [snapshot.encoded_matrix.x,snapshot.encoded_matrix.y,snapshot.encoded_matrix.z];
    let engine = BartEngine::new(settings.bart.clone(),&args.output.join("bart_work"),matrix)?;
    let mut router = AcquisitionRouter::new(snapshot,girf,settings.router,engine)?;

    let mut reader = StreamReader::open(&args.stream)?;
    let mut waveforms:Vec<Waveform> = Vec::new();
    let mut emitted = 0usize;

    loop {
        match reader.next_item()? {
            StreamItem::Acquisition(rec) => {
                if let Some(group) = router.route(rec)? {
                    let image = router.reconstruct(&group)?;
                    emit_image(&args.output,&image,&mut emitted)?;
                }
            }
            // image and waveform items pass through untouched
            StreamItem::Image(image) => emit_image(&args.output,&image,&mut emitted)?,
            StreamItem::Waveform(wf) => waveforms.push(wf),
            StreamItem::Close => break,
        }
    }

    for group in router.finish() {
        let image = router.reconstruct(&group)?;
        emit_image(&args.output,&image,&mut emitted)?;
    }

    if !waveforms.is_empty() {
        // time-order the physio data before handing it on, no gap checking
        waveforms.sort_by_key(|w| w.time_stamp);
        println!("collected {} waveform records",waveforms.len());
    }
    if router.dropped_readouts() > 0 {
        println!("{} readouts were dropped due to sequencing faults",router.dropped_readouts());
    }
    println!("emitted {} images to {:?}",emitted,args.output);
    Ok(())
}

fn emit_image(output:&std::path::Path,image:&ImageVolume,emitted:&mut usize) -> Result<(),GatewayError> {
    *emitted += 1;
    let name = format!("img_{:03}_s{}_c{}",*emitted,image.slice,image.contrast);
    cfl::to_nifti(&image.data,&output.join(name))?;
    Ok(())
}
