//! Binary frame decoder for device telemetry.
//!
//! Devices that do not speak JSON publish a protobuf container holding a
//! sequence of headers; each header carries an optionally XOR-obfuscated
//! inner payload. Only the display property upload (`cmd_func=254`,
//! `cmd_id=21`) feeds the quota cache; every other payload type is ignored.
//!
//! The decoder is stateless and safe to invoke concurrently. Any parse
//! failure yields an empty map so ingestion continues.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use prost::Message;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, warn};

use ecoflow_core::QuotaMap;

/// Outer container: an ordered sequence of framed messages.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SendHeaderMsg {
    #[prost(message, repeated, tag = "1")]
    pub msg: Vec<Header>,
}

/// Per-message frame header. Field numbering follows the layout the devices
/// use on the wire.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Header {
    #[prost(bytes = "vec", tag = "1")]
    pub pdata: Vec<u8>,
    #[prost(int32, tag = "2")]
    pub src: i32,
    #[prost(int32, tag = "3")]
    pub dest: i32,
    #[prost(int32, tag = "4")]
    pub d_src: i32,
    #[prost(int32, tag = "5")]
    pub d_dest: i32,
    #[prost(int32, tag = "6")]
    pub enc_type: i32,
    #[prost(int32, tag = "7")]
    pub check_type: i32,
    #[prost(int32, tag = "8")]
    pub cmd_func: i32,
    #[prost(int32, tag = "9")]
    pub cmd_id: i32,
    #[prost(int32, tag = "10")]
    pub data_len: i32,
    #[prost(int32, tag = "11")]
    pub need_ack: i32,
    #[prost(int32, tag = "12")]
    pub is_ack: i32,
    #[prost(int32, tag = "14")]
    pub seq: i32,
}

/// Battery pack detail nested inside the display property upload.
#[derive(Clone, PartialEq, prost::Message, Serialize)]
pub struct BmsBattInfo {
    #[prost(float, optional, tag = "1")]
    pub vol: Option<f32>,
    #[prost(float, optional, tag = "2")]
    pub amp: Option<f32>,
    #[prost(sint32, optional, tag = "3")]
    pub temp: Option<i32>,
    #[prost(uint32, optional, tag = "4")]
    pub cycles: Option<u32>,
}

/// Main device status payload (`cmd_func=254`, `cmd_id=21`).
///
/// Unset fields are omitted from the decoded map, matching what the devices
/// actually send: partial uploads are the norm.
#[derive(Clone, PartialEq, prost::Message, Serialize)]
pub struct DisplayPropertyUpload {
    #[prost(uint32, optional, tag = "1")]
    pub errcode: Option<u32>,
    #[prost(uint64, optional, tag = "2")]
    pub utc_timestamp: Option<u64>,
    #[prost(uint32, optional, tag = "3")]
    pub dev_standby_time: Option<u32>,
    #[prost(uint32, optional, tag = "4")]
    pub screen_off_time: Option<u32>,
    #[prost(uint32, optional, tag = "5")]
    pub ac_standby_time: Option<u32>,
    #[prost(uint32, optional, tag = "6")]
    pub dc_standby_time: Option<u32>,

    #[prost(float, optional, tag = "10")]
    pub pow_in_sum_w: Option<f32>,
    #[prost(float, optional, tag = "11")]
    pub pow_out_sum_w: Option<f32>,
    #[prost(float, optional, tag = "12")]
    pub pow_get_qcusb1: Option<f32>,
    #[prost(float, optional, tag = "13")]
    pub pow_get_qcusb2: Option<f32>,
    #[prost(float, optional, tag = "14")]
    pub pow_get_typec1: Option<f32>,
    #[prost(float, optional, tag = "15")]
    pub pow_get_typec2: Option<f32>,
    #[prost(float, optional, tag = "16")]
    pub pow_get_ac: Option<f32>,
    #[prost(float, optional, tag = "17")]
    pub pow_get_ac_in: Option<f32>,
    #[prost(float, optional, tag = "18")]
    pub pow_get_12v: Option<f32>,
    #[prost(float, optional, tag = "19")]
    pub pow_get_pv: Option<f32>,

    #[prost(float, optional, tag = "30")]
    pub bms_batt_soc: Option<f32>,
    #[prost(float, optional, tag = "31")]
    pub bms_batt_soh: Option<f32>,
    #[prost(uint32, optional, tag = "32")]
    pub bms_design_cap: Option<u32>,
    #[prost(uint32, optional, tag = "33")]
    pub bms_dsg_rem_time: Option<u32>,
    #[prost(uint32, optional, tag = "34")]
    pub bms_chg_rem_time: Option<u32>,
    #[prost(sint32, optional, tag = "35")]
    pub bms_min_cell_temp: Option<i32>,
    #[prost(sint32, optional, tag = "36")]
    pub bms_max_cell_temp: Option<i32>,
    #[prost(sint32, optional, tag = "37")]
    pub bms_min_mos_temp: Option<i32>,
    #[prost(sint32, optional, tag = "38")]
    pub bms_max_mos_temp: Option<i32>,
    #[prost(message, optional, tag = "39")]
    pub bms_batt_info: Option<BmsBattInfo>,

    #[prost(float, optional, tag = "50")]
    pub cms_batt_soc: Option<f32>,
    #[prost(float, optional, tag = "51")]
    pub cms_batt_soh: Option<f32>,
    #[prost(uint32, optional, tag = "52")]
    pub cms_dsg_rem_time: Option<u32>,
    #[prost(uint32, optional, tag = "53")]
    pub cms_chg_rem_time: Option<u32>,
    #[prost(uint32, optional, tag = "54")]
    pub cms_max_chg_soc: Option<u32>,
    #[prost(uint32, optional, tag = "55")]
    pub cms_min_dsg_soc: Option<u32>,
    #[prost(uint32, optional, tag = "56")]
    pub cms_oil_on_soc: Option<u32>,
    #[prost(uint32, optional, tag = "57")]
    pub cms_oil_off_soc: Option<u32>,
    #[prost(bool, optional, tag = "58")]
    pub cms_oil_self_start: Option<bool>,

    #[prost(uint32, optional, tag = "70")]
    pub ac_out_freq: Option<u32>,
    #[prost(bool, optional, tag = "71")]
    pub xboost_en: Option<bool>,
    #[prost(bool, optional, tag = "72")]
    pub ac_always_on_flag: Option<bool>,
    #[prost(float, optional, tag = "73")]
    pub plug_in_info_ac_in_vol: Option<f32>,
    #[prost(float, optional, tag = "74")]
    pub plug_in_info_ac_in_amp: Option<f32>,
    #[prost(uint32, optional, tag = "75")]
    pub plug_in_info_ac_in_chg_pow_max: Option<u32>,
    #[prost(float, optional, tag = "76")]
    pub plug_in_info_pv_vol: Option<f32>,
    #[prost(float, optional, tag = "77")]
    pub plug_in_info_pv_amp: Option<f32>,
    #[prost(uint32, optional, tag = "78")]
    pub plug_in_info_pv_chg_max: Option<u32>,

    #[prost(uint32, optional, tag = "90")]
    pub dev_online_flag: Option<u32>,
    #[prost(uint32, optional, tag = "91")]
    pub dev_sleep_state: Option<u32>,
    #[prost(uint32, optional, tag = "92")]
    pub energy_backup_state: Option<u32>,
    #[prost(uint32, optional, tag = "93")]
    pub energy_backup_start_soc: Option<u32>,
}

/// XOR each byte with the low byte of `seq`.
pub fn xor_decode(pdata: &[u8], seq: i32) -> Vec<u8> {
    let key = (seq & 0xff) as u8;
    pdata.iter().map(|b| b ^ key).collect()
}

/// Decode a raw broker payload into a flat quota map.
pub fn decode(raw: &[u8]) -> QuotaMap {
    let mut result = QuotaMap::new();

    // Some devices wrap the container in base64; failure is silent.
    let data = match BASE64.decode(raw) {
        Ok(decoded) => decoded,
        Err(_) => raw.to_vec(),
    };

    let container = match SendHeaderMsg::decode(data.as_slice()) {
        Ok(container) => container,
        Err(e) => {
            error!("Frame decode error: {}, raw data (hex): {}", e, hex::encode(&data));
            return result;
        }
    };

    if container.msg.is_empty() {
        debug!("No messages in frame container");
        return result;
    }

    for header in &container.msg {
        let pdata = if header.enc_type == 1 && header.src != 32 {
            xor_decode(&header.pdata, header.seq)
        } else {
            header.pdata.clone()
        };

        if header.cmd_func == 254 && header.cmd_id == 21 {
            match DisplayPropertyUpload::decode(pdata.as_slice()) {
                Ok(upload) => {
                    let before = result.len();
                    flatten_upload(&upload, &mut result);
                    debug!("Decoded display property upload with {} fields", result.len() - before);
                }
                Err(e) => {
                    warn!(
                        "Failed to decode display property upload: {}, payload (hex): {}",
                        e,
                        hex::encode(&pdata)
                    );
                }
            }
        } else {
            debug!(
                "Unhandled frame: cmd_func={}, cmd_id={}, payload (hex): {}",
                header.cmd_func,
                header.cmd_id,
                hex::encode(&pdata)
            );
        }
    }

    result
}

fn flatten_upload(upload: &DisplayPropertyUpload, out: &mut QuotaMap) {
    match serde_json::to_value(upload) {
        Ok(Value::Object(map)) => flatten_object("", &map, out),
        Ok(_) | Err(_) => {}
    }
}

/// Nested records contribute `parent.child` keys; sequences pass through
/// unchanged; unset fields (nulls) are dropped.
fn flatten_object(prefix: &str, map: &serde_json::Map<String, Value>, out: &mut QuotaMap) {
    for (key, value) in map {
        let full_key = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        match value {
            Value::Null => {}
            Value::Object(nested) => flatten_object(&full_key, nested, out),
            other => {
                out.insert(full_key, other.clone());
            }
        }
    }
}
