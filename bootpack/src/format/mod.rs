/*
 * SPDX-FileCopyrightText: 2023 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

pub mod args;
pub mod bootimage;
pub mod certificate;
pub mod cursor;
pub mod image;
pub mod layout;
pub mod padding;
pub mod vendorboot;
