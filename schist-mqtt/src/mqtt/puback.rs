/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::decode::utils::*;
use crate::encode::utils::*;
use crate::error::{SchistError, SchistResult};
use crate::logging::*;
use crate::mqtt::*;
use crate::mqtt::utils::*;

use log::*;
use std::collections::VecDeque;
use std::fmt;

define_ack_packet_encoding_impl!(write_puback_encoding_steps, PubackPacket, PUBACK_FIRST_BYTE);
define_ack_packet_decode_function!(decode_puback_packet, Puback, PubackPacket, "decode_puback_packet", PUBACK_FIRST_BYTE);
define_ack_packet_display_trait!(PubackPacket, "PubackPacket");
