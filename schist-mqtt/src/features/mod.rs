/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module that encompasses feature-specific logic (currently the async runtime).
 */

#[cfg(feature = "tokio")]
pub mod schist_tokio;
